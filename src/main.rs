//! Forager - 脚本化 episode 运行器
//!
//! 用法：`forager [--config <path>] <episodes.json>`
//! episodes.json 给出每个 episode 的目标、初始观察、提议者脚本与环境脚本；结果以 JSON 输出到 stdout。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Deserialize;

use forager::{
    config::load_config,
    core::{EpisodeRunner, EpisodeTask, ScriptedEnvironment, ScriptedStep, SessionSupervisor},
    memory::Observation,
    observability,
    react::ScriptedProposer,
};

#[derive(Debug, Deserialize)]
struct EpisodeFile {
    episodes: Vec<EpisodeEntry>,
}

#[derive(Debug, Deserialize)]
struct EpisodeEntry {
    goal: String,
    #[serde(default)]
    domain: Option<String>,
    initial: Observation,
    /// 提议者依次给出的动作
    actions: Vec<String>,
    /// 环境对每个动作的响应
    #[serde(default)]
    steps: Vec<ScriptedStep>,
}

fn parse_args() -> anyhow::Result<(Option<PathBuf>, PathBuf)> {
    let mut config = None;
    let mut input = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            _ if input.is_none() => input = Some(PathBuf::from(arg)),
            other => bail!("unexpected argument: {}", other),
        }
    }
    let input = input.context("usage: forager [--config <path>] <episodes.json>")?;
    Ok((config, input))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let (config_path, input) = parse_args()?;
    let cfg = load_config(config_path).context("Failed to load config")?;

    let raw = std::fs::read_to_string(&input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let file: EpisodeFile = serde_json::from_str(&raw).context("Invalid episode file")?;

    let supervisor = Arc::new(SessionSupervisor::new());
    supervisor.install_signal_handlers();

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                tracing::debug!(event = %json, "controller");
            }
        }
    });

    let default_domain = cfg.controller.domain.clone();
    let runner = EpisodeRunner::new(cfg)
        .context("Failed to create episode runner")?
        .with_supervisor(supervisor.as_ref().clone())
        .with_event_tx(event_tx);

    let tasks: Vec<EpisodeTask> = file
        .episodes
        .into_iter()
        .map(|entry| {
            let env = Arc::new(ScriptedEnvironment::new(entry.initial.clone(), entry.steps));
            let proposer = Arc::new(ScriptedProposer::new(entry.actions));
            EpisodeTask::new(
                entry.goal,
                entry.domain.unwrap_or_else(|| default_domain.clone()),
                entry.initial,
                env,
                proposer,
            )
        })
        .collect();
    tracing::info!("Running {} episodes", tasks.len());

    let outcomes = runner.run_all(tasks).await;
    let completed = outcomes.iter().filter(|o| o.is_success()).count();
    tracing::info!("{}/{} episodes completed", completed, outcomes.len());

    let report = serde_json::json!({
        "outcomes": outcomes,
        "episodes_recorded": runner.memory().map(|m| m.len()).unwrap_or(0),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
