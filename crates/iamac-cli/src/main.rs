//! Operational CLI (§4.6): a thin client over the same Postgres-backed
//! queue `iamac-worker` polls — no HTTP hop, direct `iamac-db` calls.

use anyhow::Result;
use clap::{Parser, Subcommand};
use iamac_config::Settings;
use serde_json::json;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "iamac")]
#[command(about = "IAMA durable orchestration core CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a new refactor job.
    StartJob {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        tier: String,
        #[arg(long, default_value = "IDE_LOCAL")]
        execution_mode: String,
        /// Caller-assigned id. Generated if omitted.
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Deliver a signal to a running job.
    Signal {
        job_id: String,
        #[command(subcommand)]
        cmd: SignalCmd,
    },

    /// Print the job's currentState.
    Query { job_id: String },

    /// Start a RevertWorkflow for a delivered job.
    Revert {
        job_id: String,
        #[arg(long)]
        user_id: String,
    },
}

#[derive(Subcommand)]
enum SignalCmd {
    ProposalSelected {
        #[arg(long)]
        proposal_id: String,
    },
    SpecApproved,
    InterventionAction {
        /// DEEP_FIX | CONTINUE | COMMAND | ESCALATE | CANCEL | TESTS_PASSED
        #[arg(long)]
        action: String,
    },
    SpecUpdated,
    /// Reserved: captured but not wired into the repair loop.
    HeartbeatReceived,
    /// Reserved for the NL-convert preview flow; not consumed by the core loop.
    NlConvertRequested {
        #[arg(long)]
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let pool = iamac_db::connect(&settings.database_url).await?;

    match cli.cmd {
        Commands::StartJob {
            user_id,
            tier,
            execution_mode,
            job_id,
        } => {
            let job_id = job_id.unwrap_or_else(|| format!("job_{}", Uuid::new_v4()));

            iamac_db::insert_job(
                &pool,
                &iamac_db::NewJob {
                    job_id: job_id.clone(),
                    owner_id: user_id.clone(),
                    execution_mode: execution_mode.clone(),
                },
            )
            .await?;

            let run_id = format!("refactor-{job_id}");
            iamac_db::enqueue_workflow_run(
                &pool,
                &iamac_db::NewWorkflowRun {
                    run_id: &run_id,
                    workflow_type: iamac_workflow::REFACTOR_JOB_WORKFLOW,
                    task_queue: &settings.temporal_task_queue,
                    input: json!({
                        "job_id": job_id,
                        "user_id": user_id,
                        "tier": tier,
                        "execution_mode": execution_mode,
                    }),
                },
            )
            .await?;

            println!("job_id={job_id}");
            println!("run_id={run_id}");
        }

        Commands::Signal { job_id, cmd } => {
            let run_id = format!("refactor-{job_id}");
            let (signal_name, payload) = match cmd {
                SignalCmd::ProposalSelected { proposal_id } => (
                    "proposalSelected",
                    json!({ "proposalId": proposal_id }),
                ),
                SignalCmd::SpecApproved => ("specApproved", json!({})),
                SignalCmd::InterventionAction { action } => {
                    ("interventionAction", json!({ "action": action }))
                }
                SignalCmd::SpecUpdated => ("specUpdatedDuringExecution", json!({})),
                SignalCmd::HeartbeatReceived => ("heartbeatReceived", json!({})),
                SignalCmd::NlConvertRequested { payload } => (
                    "nlConvertRequested",
                    payload
                        .map(|p| json!({ "payload": p }))
                        .unwrap_or(json!({})),
                ),
            };

            iamac_db::workflow_send_signal(&pool, &run_id, signal_name, &payload).await?;
            println!("job_id={job_id}");
            println!("signal={signal_name}");
        }

        Commands::Query { job_id } => match iamac_db::fetch_job(&pool, &job_id).await? {
            Some(row) => {
                println!("job_id={}", row.id);
                println!("state={}", row.status);
                println!("phase={}", row.phase);
                println!("attempt_count={}", row.attempt_count);
                println!(
                    "identical_failure_count={}",
                    row.identical_failure_count
                );
                if let Some(reason) = row.failure_reason {
                    println!("failure_reason={reason}");
                }
            }
            None => {
                anyhow::bail!("no job {job_id}");
            }
        },

        Commands::Revert { job_id, user_id } => {
            let run_id = format!("revert-{job_id}");
            iamac_db::enqueue_workflow_run(
                &pool,
                &iamac_db::NewWorkflowRun {
                    run_id: &run_id,
                    workflow_type: iamac_workflow::REVERT_WORKFLOW,
                    task_queue: &settings.temporal_task_queue,
                    input: json!({ "job_id": job_id, "user_id": user_id }),
                },
            )
            .await?;
            println!("job_id={job_id}");
            println!("run_id={run_id}");
        }
    }

    Ok(())
}
