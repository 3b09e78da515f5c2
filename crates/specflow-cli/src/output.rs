use serde::Serialize;
use specflow_core::state::FlowState;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  ").trim_end());

    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

/// Human-readable summary of a flow.
pub fn print_flow(state: &FlowState) {
    println!("Flow:     {}", state.feature);
    println!("Phase:    {}", state.phase);
    println!("Mode:     {}", state.metadata.mode);
    if let Some(tier) = &state.metadata.tier {
        println!("Tier:     {tier}");
    }
    if let Some(url) = &state.metadata.pr_url {
        println!("PR:       {url}");
    }
    println!("Updated:  {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("History:  {} phase(s)", state.history.len());

    let suggestions = state.recovery_suggestions();
    if !suggestions.is_empty() {
        println!("\nNext steps:");
        for s in suggestions {
            println!("  {s}");
        }
    }
}
