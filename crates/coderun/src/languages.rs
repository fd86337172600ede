use anyhow::Result;
use colored::Colorize;
use serde_json::json;

use crate::config::ProjectConfig;

pub async fn handle_languages_command(config: &ProjectConfig, json: bool) -> Result<()> {
    let runner = config.sandbox_runner();
    let availability = runner.availability().await;

    if json {
        let entries: Vec<_> = availability
            .iter()
            .map(|(language, toolchain, available)| {
                json!({
                    "language": language.to_string(),
                    "toolchain": toolchain.name(),
                    "binary": toolchain.binary_path().display().to_string(),
                    "available": available,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for (language, toolchain, available) in availability {
        let mark = if available {
            "✓".bright_green()
        } else {
            "✗".bright_red()
        };
        println!(
            "  {} {:<8} {} {}",
            mark,
            language.to_string().bold(),
            toolchain.name(),
            format!("({})", toolchain.binary_path().display()).dimmed()
        );
    }
    Ok(())
}
