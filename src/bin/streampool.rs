// Copyright 2024 The Streampool Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use streampool_config::processor::StreampoolConfig;
use streampool_error::Error;
use streampool_scheduler::memory_task_state::{
    MemoryEventSearch, MemoryTaskState, StaticNodeSource,
};
use streampool_scheduler::task_creator::TaskCreator;
use streampool_scheduler::task_state_manager::StatisticsSink;
use streampool_util::processor_messages::NodeId;
use streampool_util::{init_tracing, spawn};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{event, Level};

/// Seconds between driven creation passes.
const CREATE_INTERVAL_S: u64 = 10;

/// Seconds between queue statistics emissions.
const STATISTICS_INTERVAL_S: u64 = 60;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,
}

/// Statistics sink that writes queue-size samples to the log.
struct LogStatisticsSink;

impl StatisticsSink for LogStatisticsSink {
    fn emit_queue_size(&self, queue_size: usize, timestamp_ms: u64) -> Result<(), Error> {
        event!(Level::INFO, queue_size, timestamp_ms, "Task queue size");
        Ok(())
    }
}

async fn run(config: StreampoolConfig) -> Result<(), Error> {
    let state = MemoryTaskState::new();
    let event_search = MemoryEventSearch::new();
    let creator = TaskCreator::new(
        &config.processor,
        state.clone(),
        state.clone(),
        state,
        event_search,
        Arc::new(LogStatisticsSink),
        StaticNodeSource::new(NodeId::new()),
        SystemTime::now as fn() -> SystemTime,
    );

    creator.startup().await?;
    event!(Level::INFO, "Task creator started");

    let create_creator = creator.clone();
    let create_loop = spawn!("create_tasks_schedule", async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CREATE_INTERVAL_S));
        loop {
            interval.tick().await;
            if let Err(err) = create_creator.create_tasks().await {
                event!(Level::ERROR, ?err, "Scheduled creation pass failed");
            }
        }
    });

    let statistics_creator = creator.clone();
    let statistics_loop = spawn!("queue_statistics_schedule", async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STATISTICS_INTERVAL_S));
        loop {
            interval.tick().await;
            statistics_creator.write_queue_statistics();
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            event!(Level::WARN, "Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            event!(Level::WARN, "Received SIGTERM, shutting down");
        }
    }

    // Dropping the guards aborts the periodic loops before teardown.
    drop(create_loop);
    drop(statistics_loop);
    creator.shutdown().await;
    event!(Level::INFO, "Task creator stopped");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    let args = Args::parse();
    let config_data = std::fs::read_to_string(&args.config_file)?;
    let config: StreampoolConfig = serde_json::from_str(&config_data)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))?;
    Ok(())
}
