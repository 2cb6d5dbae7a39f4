//! The DATA-phase content-filter pipeline.
//!
//! Wires zero or more filter commands into a shell-style pipeline: the
//! first command reads the captured body, each subsequent command reads
//! the previous one's stdout, and the last command's stdout becomes the
//! new body. All processes are started before any is awaited, the
//! intermediate pipes are plumbed directly between adjacent children by
//! the OS (never funneled through this process), and the body-feeding
//! writer runs on its own thread concurrently with reaping so a body
//! larger than the first pipe's buffer can't deadlock the proxy.

use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::thread;

use anyhow::{bail, Context, Result};

use crate::body::BodyHandle;

/// One stage of the pipeline: argv[0] is the executable, the rest are its
/// arguments.
pub type FilterSpec = Vec<String>;

/// Runs `body` through `filters` in declaration order and returns the
/// pipeline's output as the new body.
///
/// An empty `filters` list is the identity transform. Any non-zero exit or
/// spawn failure fails the whole pipeline; the caller aborts the session
/// rather than forward a possibly-unfiltered body.
pub fn run(filters: &[FilterSpec], mut body: BodyHandle) -> Result<BodyHandle> {
    if filters.is_empty() {
        return Ok(body);
    }

    let feed_source = body.duplicate_for_feed()?;
    let sink = tempfile::tempfile().context("failed to create filter output sink")?;

    let mut children: Vec<Child> = Vec::with_capacity(filters.len());
    let mut prev_stdout: Option<std::process::ChildStdout> = None;
    let mut first_stdin: Option<std::process::ChildStdin> = None;

    for (i, argv) in filters.iter().enumerate() {
        let (program, args) = argv
            .split_first()
            .context("filter command must have at least one argument")?;

        let mut cmd = Command::new(program);
        cmd.args(args);

        match prev_stdout.take() {
            Some(stdout) => {
                cmd.stdin(Stdio::from(stdout));
            }
            None => {
                cmd.stdin(Stdio::piped());
            }
        }

        if i + 1 == filters.len() {
            cmd.stdout(Stdio::from(sink.try_clone()?));
        } else {
            cmd.stdout(Stdio::piped());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn filter {:?}", argv))?;

        prev_stdout = child.stdout.take();
        if i == 0 {
            first_stdin = child.stdin.take();
        }
        children.push(child);
    }

    // All processes are now running; feed the body into the first one on a
    // dedicated thread so this thread is free to reap without risking a
    // full-pipe deadlock.
    let feeder = first_stdin.map(|mut stdin| {
        thread::spawn(move || -> Result<()> {
            let mut source = feed_source;
            std::io::copy(&mut source, &mut stdin)?;
            drop(stdin);
            Ok(())
        })
    });

    let mut all_ok = true;
    for (i, mut child) in children.into_iter().enumerate() {
        let status = child
            .wait()
            .with_context(|| format!("failed to await filter stage {}", i))?;
        if !status.success() {
            all_ok = false;
        }
    }

    if let Some(handle) = feeder {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.context("filter body-feeder thread failed")),
            Err(_) => bail!("filter body-feeder thread panicked"),
        }
    }

    if !all_ok {
        bail!("content filter pipeline exited non-zero");
    }

    let mut output = BodyHandle::from_file(sink);
    output.rewind()?;
    Ok(output)
}

/// Parses one whitespace-separated CLI positional into a `FilterSpec`.
pub fn parse_spec(raw: &str) -> Result<FilterSpec> {
    let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        bail!("filter command specification must not be empty");
    }
    Ok(argv)
}
