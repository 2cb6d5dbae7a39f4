//! Command-line argument parsing and eager validation.
//!
//! Validates configuration completely before touching a socket and returns
//! a descriptive `anyhow::Error` rather than panicking, with `clap`'s
//! derive API doing the argv parsing.

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::filter::{self, FilterSpec};

/// A transparent SMTP relay that pipes the DATA payload through an
/// external content-filter chain.
#[derive(Parser, Debug)]
#[command(name = "smtp_filter_relay", version, about)]
pub struct Args {
    /// Address and port to listen on, e.g. `0.0.0.0:10025`.
    pub listen: String,

    /// Address and port of the upstream SMTP server, e.g. `127.0.0.1:25`.
    pub upstream: String,

    /// Worker pool width.
    #[arg(long, default_value_t = 16)]
    pub children: usize,

    /// Lower bound of the per-worker randomized session count.
    #[arg(long, default_value_t = 100)]
    pub minperchild: u32,

    /// Upper bound of the per-worker randomized session count.
    #[arg(long, default_value_t = 200)]
    pub maxperchild: u32,

    /// Rewrite the outbound banner and HELO/EHLO identity to this FQDN.
    #[arg(long)]
    pub helo: Option<String>,

    /// Write a per-worker dialogue transcript to `PREFIX.<pid>`.
    #[arg(long)]
    pub debugtrace: Option<String>,

    /// Content-filter command specifications, each one whitespace-separated
    /// argv (quote each as a single shell word), applied in declaration
    /// order.
    pub filters: Vec<String>,
}

/// Validated, ready-to-run configuration derived from `Args`.
pub struct RelayConfig {
    pub listen_addr: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub children: usize,
    pub min_per_child: u32,
    pub max_per_child: u32,
    pub helo: Option<String>,
    pub debugtrace_prefix: Option<String>,
    pub filters: Vec<FilterSpec>,
}

impl RelayConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        if args.children == 0 {
            bail!("--children must be at least 1");
        }
        if args.minperchild == 0 {
            bail!("--minperchild must be at least 1");
        }
        if args.minperchild > args.maxperchild {
            bail!(
                "--minperchild ({}) must not exceed --maxperchild ({})",
                args.minperchild,
                args.maxperchild
            );
        }
        let (upstream_host, upstream_port) = split_addr(&args.upstream)
            .with_context(|| format!("invalid upstream address {:?}", args.upstream))?;
        // The listen address is validated by the eventual bind() call in
        // `pool::Pool::run`; binding is itself the only complete test of
        // "is this address usable" (interface existence, permissions).
        split_addr(&args.listen)
            .with_context(|| format!("invalid listen address {:?}", args.listen))?;

        let filters = args
            .filters
            .iter()
            .map(|raw| filter::parse_spec(raw))
            .collect::<Result<Vec<_>>>()?;

        Ok(RelayConfig {
            listen_addr: args.listen,
            upstream_host,
            upstream_port,
            children: args.children,
            min_per_child: args.minperchild,
            max_per_child: args.maxperchild,
            helo: args.helo,
            debugtrace_prefix: args.debugtrace,
            filters,
        })
    }
}

/// Splits a `host:port` string, validating that the port parses as a
/// `u16`. IPv6 literals must be bracketed (`[::1]:25`), matching the
/// convention `std::net::SocketAddr`'s `FromStr` uses.
fn split_addr(raw: &str) -> Result<(String, u16)> {
    let (host, port) = raw
        .rsplit_once(':')
        .with_context(|| format!("expected HOST:PORT, got {:?}", raw))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("port {:?} is not a valid u16", port))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(listen: &str, upstream: &str, filters: Vec<&str>) -> Args {
        Args {
            listen: listen.to_string(),
            upstream: upstream.to_string(),
            children: 16,
            minperchild: 100,
            maxperchild: 200,
            helo: None,
            debugtrace: None,
            filters: filters.into_iter().map(str::to_string).collect(),
        }
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(
            split_addr("127.0.0.1:2525").unwrap(),
            ("127.0.0.1".to_string(), 2525)
        );
    }

    #[test]
    fn rejects_missing_port() {
        assert!(split_addr("127.0.0.1").is_err());
    }

    #[test]
    fn rejects_min_greater_than_max() {
        let mut a = args("0.0.0.0:10025", "127.0.0.1:25", vec![]);
        a.minperchild = 300;
        a.maxperchild = 200;
        assert!(RelayConfig::from_args(a).is_err());
    }

    #[test]
    fn parses_trailing_filter_specs() {
        let a = args(
            "0.0.0.0:10025",
            "127.0.0.1:25",
            vec!["tr a-z A-Z", "sed s/x/y/"],
        );
        let cfg = RelayConfig::from_args(a).unwrap();
        assert_eq!(cfg.filters.len(), 2);
        assert_eq!(cfg.filters[0], vec!["tr", "a-z", "A-Z"]);
    }
}
