// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::env;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use fedflow::ExecEnv;
use fedflow::common::app_config::RuntimeConfig;
use fedflow::exec::batch::{Batch, BatchType, TermBatch, TermBatchType};
use fedflow::exec::pipeline::diagnostics::render_graph;
use fedflow::exec::pipeline::{
    BatchEmitter, EmitterRef, FanIn, ForwardEmitter, Outcome, ResultCursor, Vars,
    fan_out,
};
use fedflow::fedflow_config;
use fedflow::fedflow_logging::{self, error, info, warn};

const DEFAULT_ROWS: usize = 10_000;
const SOURCES: usize = 4;
const CONSUMERS: usize = 2;
const CURSOR_CHUNK_ROWS: u64 = 512;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

struct Args {
    mode: String,
    config_path: Option<String>,
    rows: usize,
}

fn parse_args() -> Args {
    let args: Vec<String> = env::args().collect();
    let mut idx = 1usize;
    let mode = if args.get(idx).is_some_and(|s| !s.starts_with('-')) {
        let m = args[idx].clone();
        idx += 1;
        m
    } else {
        "run".to_string()
    };

    let mut config_path: Option<String> = None;
    let mut rows = DEFAULT_ROWS;
    while let Some(arg) = args.get(idx) {
        match arg.as_str() {
            "--config" | "-c" => {
                idx += 1;
                config_path = args.get(idx).cloned();
                if config_path.is_none() {
                    eprintln!("missing value for --config/-c");
                    process::exit(1);
                }
                idx += 1;
            }
            "--rows" | "-n" => {
                idx += 1;
                rows = match args.get(idx).map(|v| v.parse::<usize>()) {
                    Some(Ok(n)) => n,
                    Some(Err(e)) => {
                        eprintln!("invalid value for --rows: {e}");
                        process::exit(1);
                    }
                    None => {
                        eprintln!("missing value for --rows/-n");
                        process::exit(1);
                    }
                };
                idx += 1;
            }
            "--help" | "-h" => {
                eprintln!("Usage: fedflow [run] [--config <path>] [--rows <n>]");
                eprintln!("  run      - Run the streaming self-check plan (default)");
                process::exit(0);
            }
            other => {
                eprintln!("unknown arg: {other} (try --help)");
                process::exit(1);
            }
        }
    }
    Args {
        mode,
        config_path,
        rows,
    }
}

/// Load the config file, or fall back to built-in defaults when none exists.
fn load_runtime(config_path: Option<&str>) -> Result<(String, RuntimeConfig)> {
    let cfg = match config_path {
        Some(p) => fedflow_config::init_from_path(p)
            .with_context(|| format!("load fedflow config {p}"))?,
        None => match fedflow_config::init_from_env_or_default() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("no config loaded ({e}); using defaults");
                return Ok(("info".to_string(), RuntimeConfig::default()));
            }
        },
    };
    Ok((cfg.effective_log_filter().to_string(), cfg.runtime.clone()))
}

/// `SOURCES` captured batches -> forwarders -> fan-in -> fan-out to `CONSUMERS` cursors.
fn build_plan(env: &ExecEnv, rows: usize) -> Result<Vec<EmitterRef<TermBatch>>> {
    let ctx = env.context();
    let batch_type: Arc<dyn BatchType<TermBatch>> = Arc::new(TermBatchType::new());
    let mut forwarded: Vec<EmitterRef<TermBatch>> = Vec::with_capacity(SOURCES);
    for idx in 0..SOURCES {
        let source = BatchEmitter::new(
            ctx,
            format!("values-{idx}"),
            Vars::new(["s", "o"]),
            batch_type.clone(),
            TermBatch::sequential(2, rows),
        );
        let forwarder = ForwardEmitter::<TermBatch>::new(ctx, format!("forward-{idx}"), source)
            .map_err(|e| anyhow!("build forwarder {idx}: {e}"))?;
        forwarded.push(forwarder);
    }
    let merged: EmitterRef<TermBatch> =
        FanIn::new(ctx, "union", Vars::new(["s", "o"]), batch_type, forwarded)
        .map_err(|e| anyhow!("build fan-in: {e}"))?;
    let outputs = fan_out::<TermBatch>(ctx, "shared", merged, CONSUMERS)
        .map_err(|e| anyhow!("build fan-out: {e}"))?;
    Ok(outputs
        .into_iter()
        .map(|o| o as EmitterRef<TermBatch>)
        .collect())
}

fn run_self_check(env: &ExecEnv, rows: usize) -> Result<()> {
    let roots = build_plan(env, rows)?;
    let expected = (rows * SOURCES) as u64;
    let on_signal = roots.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt signal, cancelling plan...");
        for root in &on_signal {
            root.cancel();
        }
    })
    .context("install Ctrl-C handler")?;

    let started = Instant::now();
    let mut consumers = Vec::with_capacity(roots.len());
    for (idx, root) in roots.iter().enumerate() {
        let cursor = ResultCursor::attach(root.clone(), CURSOR_CHUNK_ROWS)
            .map_err(|e| anyhow!("attach consumer {idx}: {e}"))?;
        let handle = thread::Builder::new()
            .name(format!("fedflow-consumer-{idx}"))
            .spawn(move || cursor.drain(DRAIN_TIMEOUT))
            .with_context(|| format!("spawn consumer {idx}"))?;
        consumers.push(handle);
    }

    let mut failures = 0;
    for (idx, handle) in consumers.into_iter().enumerate() {
        let drained = handle
            .join()
            .map_err(|_| anyhow!("consumer {idx} panicked"))?;
        match drained {
            Ok(d) if d.outcome == Outcome::Completed && d.rows == expected => {
                let widths_ok = d.batches.iter().all(|b| b.cols() == 2);
                info!(
                    "consumer {} received {} rows in {} batches (widths ok: {})",
                    idx,
                    d.rows,
                    d.batches.len(),
                    widths_ok
                );
            }
            Ok(d) => {
                failures += 1;
                warn!(
                    "consumer {} ended {} with {} of {} rows, cause={:?}",
                    idx,
                    d.outcome.label(),
                    d.rows,
                    expected,
                    d.cause
                );
            }
            Err(e) => {
                failures += 1;
                error!("consumer {} failed: {}", idx, e);
                for root in &roots {
                    eprintln!("{}", render_graph(root));
                }
            }
        }
    }
    let stats = env.stats();
    info!(
        "self-check finished in {:?}: tasks_run={} steals={} overflow_pushes={} parks={}",
        started.elapsed(),
        stats.tasks_run,
        stats.steals,
        stats.overflow_pushes,
        stats.parks
    );
    if failures > 0 {
        return Err(anyhow!("{failures} consumer(s) did not complete"));
    }
    println!(
        "fedflow self-check ok: {} consumers x {} rows",
        CONSUMERS, expected
    );
    Ok(())
}

fn main() {
    let args = parse_args();
    if args.mode != "run" {
        eprintln!("unknown mode: {} (try --help)", args.mode);
        process::exit(1);
    }

    let (filter, runtime) = match load_runtime(args.config_path.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e:#}");
            process::exit(1);
        }
    };
    fedflow_logging::init_with_level(&filter);

    let env = match ExecEnv::from_runtime(&runtime) {
        Ok(env) => env,
        Err(e) => {
            error!("failed to start exec env: {:#}", e);
            process::exit(1);
        }
    };
    let result = run_self_check(&env, args.rows);
    env.shutdown();
    if let Err(e) = result {
        error!("self-check failed: {:#}", e);
        process::exit(1);
    }
}
