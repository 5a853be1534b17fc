use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufReadExt, BufReader};

use pro_checkin::config::AppConfig;
use pro_checkin::llm::create_provider;
use pro_checkin::responder::LlmResponder;
use pro_checkin::store::LibSqlBackend;
use pro_checkin::workflow::WorkflowPhase;
use pro_checkin::{Projection, TurnController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("Failed to load configuration")?;

    eprintln!("PRO check-in v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Commands: /history, /alerts, /quit\n");

    let llm = create_provider(&config.llm)?;
    let store = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let responder = Arc::new(LlmResponder::new(llm));
    let controller = TurnController::from_store(store, responder, &config.workflow);

    let user_id = config.user_id.as_str();
    let opening = controller.begin(user_id, None).await?;
    let patient_id = opening.patient_id.to_string();
    print_projection(&opening);
    if opening.phase == WorkflowPhase::Completed {
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "/quit" => break,
            "/history" => {
                for record in controller.record_history(user_id, Some(&patient_id)).await? {
                    let fields = record
                        .data
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    println!("  {} {fields}", record.collected_at.format("%Y-%m-%d %H:%M"));
                }
                continue;
            }
            "/alerts" => {
                for alert in controller.alert_history(user_id, Some(&patient_id)).await? {
                    println!(
                        "  {} [{}] {}: {}",
                        alert.triggered_at.format("%Y-%m-%d %H:%M"),
                        alert.severity,
                        alert.alert_type,
                        alert.summary
                    );
                }
                continue;
            }
            _ => {}
        }

        match controller.continue_turn(user_id, &patient_id, line).await {
            Ok(projection) => {
                print_projection(&projection);
                if projection.phase == WorkflowPhase::Completed {
                    break;
                }
            }
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    Ok(())
}

fn print_projection(projection: &Projection) {
    println!("\n{}\n", projection.assistant_text);
    eprintln!("   [{} | {}]", projection.phase, projection.emotional_state);
}
