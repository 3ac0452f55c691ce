use std::collections::HashMap;

use anyhow::{bail, format_err, Result};
use clap::Parser;
use deqp_remote_runner::config::InstanceArgs;
use deqp_remote_runner::summary::{write_summary, Summary};
use deqp_remote_runner::*;
use slog::{info, o, Drain};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    real_main().await
}

async fn real_main() -> Result<()> {
    let mut options: Options = Options::parse();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }

    if PROGRESS_BAR.is_hidden() {
        options.no_progress = true;
    }

    let logger = if !options.no_progress {
        let decorator = slog_pg::ProgressBarDecorator::new(PROGRESS_BAR.clone());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain).fuse();
        let drain = slog_async::Async::new(drain).build().fuse();

        slog::Logger::root(drain, o!())
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::CompactFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain).fuse();
        let drain = slog_async::Async::new(drain).build().fuse();

        slog::Logger::root(drain, o!())
    };

    // Read test file
    let test_file = match tokio::fs::read_to_string(&options.tests).await {
        Ok(r) => r,
        Err(e) => bail!("Failed to read test list file {:?}: {}", options.tests, e),
    };
    let mut tests: Vec<TestId> = parse_test_file(&test_file)
        .into_iter()
        .map(TestId::from_path)
        .collect();

    if let Some(end) = options.end {
        tests.truncate(end);
    }
    if let Some(start) = options.start {
        tests.drain(..std::cmp::min(start, tests.len()));
    }
    if options.shuffle {
        shuffle_tests(&mut tests);
    }

    // Read instance arguments
    let mut instance_args = HashMap::new();
    if let Some(path) = &options.instances {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format_err!("Failed to read instance file {:?}: {}", path, e))?;
        let args: HashMap<String, Vec<InstanceArgs>> = serde_json::from_str(&content)
            .map_err(|e| format_err!("Failed to parse instance file {:?}: {}", path, e))?;
        instance_args = args
            .into_iter()
            .map(|(path, args)| (TestId::from_path(&path), args))
            .collect();
    }

    std::fs::create_dir_all(&options.output)
        .map_err(|e| format_err!("Failed to create output directory {:?}: {}", options.output, e))?;

    let mut summary =
        Summary::new(logger.clone(), &tests).with_run_log(&options.output.join(LOG_FILE));
    if options.collect_logs {
        summary = summary.with_log_dir(options.output.join(TEST_LOG_DIR));
    }
    if !options.no_progress {
        summary = summary.with_progress_bar(PROGRESS_BAR.clone());
    }

    let run_options = RunOptions {
        package: options.package,
        abi: options.abi.clone(),
        apk: options.apk.clone(),
        collect_logs: options.collect_logs,
        batch_size: options.batch_size,
        timeout: std::time::Duration::from_secs(options.timeout.into()),
    };
    let device = AdbDevice::new(logger.clone(), options.serial.clone()).with_adb(options.adb);

    info!(logger, "Running"; "tests" => tests.len(), "package" => %options.package,
        "serial" => ?options.serial);

    let res = {
        let mut runner = DeqpTestRunner::new(
            logger.clone(),
            device,
            &mut summary,
            &tests,
            &instance_args,
            run_options,
        );
        tokio::select! {
            res = runner.run() => res,
            _ = tokio::signal::ctrl_c() => {
                info!(logger, "Killed by sigint");
                Ok(())
            }
        }
    };

    write_summary(
        &summary,
        Some(&options.output.join(CSV_SUMMARY)),
        Some(&options.output.join(XML_SUMMARY)),
    )?;

    // Print stats
    let stats = summary.stats();
    info!(logger, "Tests finished"; "total" => stats.total, "pass" => stats.pass,
        "fail" => stats.fail, "not_run" => stats.not_run);

    run_result(res)
}

/// Partial results are written at this point, an aborted run still fails the process.
fn run_result(res: Result<(), RunError>) -> Result<()> {
    res.map_err(|e| format_err!("Test run failed: {}", e))
}
