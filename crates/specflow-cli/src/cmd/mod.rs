pub mod config;
pub mod flow;
pub mod init;
pub mod plugin;
