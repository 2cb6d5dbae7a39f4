//! A transparent SMTP relay that forwards the client/upstream dialogue
//! verbatim and, on the DATA payload, pipes the message body through an
//! externally configured chain of content-filter subprocesses before
//! delivering it onward.
//!
//! The proxying engine is a fixed-width pool of preforked worker
//! processes ([`pool`]), each serving SMTP sessions one at a time by
//! weaving together the server-side dialogue ([`server`]), the
//! upstream-facing client ([`client`]), and the filter pipeline
//! ([`filter`]) — see [`worker`] for the orchestration.

pub mod body;
pub mod cli;
pub mod client;
pub mod codec;
pub mod filter;
pub mod pool;
pub mod server;
pub mod trace;
pub mod worker;

use anyhow::Result;
use log::info;

use cli::RelayConfig;
use pool::Pool;
use worker::WorkerConfig;

/// Builds the worker pool from a validated `RelayConfig` and runs it to
/// completion. Returns once the parent has received a termination signal
/// and broadcast it to every live worker.
pub fn run(config: RelayConfig) -> Result<()> {
    info!(
        "starting smtp_filter_relay v{}: {} -> {}:{} ({} children, {} filter stage(s))",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr,
        config.upstream_host,
        config.upstream_port,
        config.children,
        config.filters.len(),
    );

    let pool = Pool {
        listen_addr: config.listen_addr,
        width: config.children,
        worker_config: WorkerConfig {
            upstream_host: config.upstream_host,
            upstream_port: config.upstream_port,
            helo: config.helo,
            debugtrace_prefix: config.debugtrace_prefix,
            filters: config.filters,
            min_per_child: config.min_per_child,
            max_per_child: config.max_per_child,
        },
    };

    pool.run()
}
