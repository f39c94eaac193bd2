use std::{
    env, fmt,
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use crate::{
    error::{EdgeErr, Result},
    training::Hyperparameters,
};

const DEFAULT_OPERATOR_ADDR: &str = "localhost:8787";
const DEFAULT_LISTEN_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::UNSPECIFIED, 7878);
const DEFAULT_MAX_CONNECTIONS: usize = 10;
const DEFAULT_REPORT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DRAIN_GRACE_MS: u64 = 5_000;
const DEFAULT_REPOS_ROOT: &str = "/repos";
const DEFAULT_POPULATION: usize = 60_000;
const DEFAULT_SAMPLE_SIZE: usize = 2_000;

/// Startup configuration of an edge node, read once from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeConfig {
    /// Operator endpoint receiving `LocalTrainFinish`, as `host:port`.
    pub operator_addr: String,
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
    pub report_timeout: Duration,
    /// How long open connections may linger once shutdown was signaled.
    pub drain_grace: Duration,
    pub repos_root: String,
    pub population: usize,
    pub sample_size: usize,
    pub seed: Option<u64>,
    pub train_program: String,
    pub train_args: Vec<String>,
    pub hyperparameters: Hyperparameters,
}

impl EdgeConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    /// Returns `EdgeErr::Config` if a variable is malformed or a required one is missing.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, validating every value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let operator_addr = var("OPERATOR_URI").unwrap_or_else(|| DEFAULT_OPERATOR_ADDR.into());
        validate_host_port("OPERATOR_URI", &operator_addr)?;

        let listen_addr: SocketAddr =
            parse_var(&var, "APPLICATION_URI", SocketAddr::from(DEFAULT_LISTEN_ADDR))?;

        let max_connections = parse_var(&var, "EDGE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            return Err(EdgeErr::Config(
                "EDGE_MAX_CONNECTIONS must be positive".into(),
            ));
        }

        let report_timeout_ms =
            parse_var(&var, "EDGE_REPORT_TIMEOUT_MS", DEFAULT_REPORT_TIMEOUT_MS)?;
        let drain_grace_ms = parse_var(&var, "EDGE_DRAIN_GRACE_MS", DEFAULT_DRAIN_GRACE_MS)?;

        let train_program = var("EDGE_TRAIN_CMD")
            .ok_or_else(|| EdgeErr::Config("EDGE_TRAIN_CMD is required".into()))?;
        let train_args = var("EDGE_TRAIN_ARGS")
            .map(|args| args.split_whitespace().map(String::from).collect())
            .unwrap_or_default();

        let defaults = Hyperparameters::default();
        let hyperparameters = Hyperparameters {
            batch_size: parse_var(&var, "EDGE_BATCH_SIZE", defaults.batch_size)?,
            miss_rate: parse_var(&var, "EDGE_MISS_RATE", defaults.miss_rate)?,
            hint_rate: parse_var(&var, "EDGE_HINT_RATE", defaults.hint_rate)?,
            alpha: parse_var(&var, "EDGE_ALPHA", defaults.alpha)?,
        };

        Ok(Self {
            operator_addr,
            listen_addr,
            max_connections,
            report_timeout: Duration::from_millis(report_timeout_ms),
            drain_grace: Duration::from_millis(drain_grace_ms),
            repos_root: var("EDGE_REPOS_ROOT").unwrap_or_else(|| DEFAULT_REPOS_ROOT.into()),
            population: parse_var(&var, "EDGE_POPULATION", DEFAULT_POPULATION)?,
            sample_size: parse_var(&var, "EDGE_SAMPLE_SIZE", DEFAULT_SAMPLE_SIZE)?,
            seed: var("EDGE_SEED")
                .map(|seed| parse("EDGE_SEED", &seed))
                .transpose()?,
            train_program,
            train_args,
            hyperparameters,
        })
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| EdgeErr::Config(format!("{key}={value:?}: {e}")))
}

/// Parses the variable `key` if set, falling back to `default` otherwise.
fn parse_var<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    var(key).map_or(Ok(default), |value| parse(key, &value))
}

/// Checks that `value` looks like `host:port` without resolving it.
fn validate_host_port(key: &str, value: &str) -> Result<()> {
    let invalid = || EdgeErr::Config(format!("{key}={value:?} is not host:port"));

    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<EdgeConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        EdgeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_follow_the_deployment() {
        let config = config(&[("EDGE_TRAIN_CMD", "/opt/gain/train")]).unwrap();

        assert_eq!(config.operator_addr, "localhost:8787");
        assert_eq!(config.listen_addr, SocketAddr::from(([0, 0, 0, 0], 7878)));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.report_timeout, Duration::from_secs(10));
        assert_eq!(config.drain_grace, Duration::from_secs(5));
        assert_eq!(config.repos_root, "/repos");
        assert_eq!((config.population, config.sample_size), (60_000, 2_000));
        assert_eq!(config.seed, None);
        assert!(config.train_args.is_empty());
        assert_eq!(config.hyperparameters, Hyperparameters::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("EDGE_TRAIN_CMD", "python3"),
            ("EDGE_TRAIN_ARGS", "  gain.py --quiet "),
            ("OPERATOR_URI", "operator.svc:9000"),
            ("APPLICATION_URI", "127.0.0.1:7000"),
            ("EDGE_SEED", "11"),
            ("EDGE_BATCH_SIZE", "64"),
            ("EDGE_DRAIN_GRACE_MS", "250"),
        ])
        .unwrap();

        assert_eq!(config.operator_addr, "operator.svc:9000");
        assert_eq!(config.listen_addr.port(), 7000);
        assert_eq!(config.seed, Some(11));
        assert_eq!(config.train_args, ["gain.py", "--quiet"]);
        assert_eq!(config.hyperparameters.batch_size, 64);
        assert_eq!(config.drain_grace, Duration::from_millis(250));
    }

    #[test]
    fn trainer_program_is_required() {
        assert!(matches!(config(&[]), Err(EdgeErr::Config(_))));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for (key, value) in [
            ("OPERATOR_URI", "operator"),
            ("OPERATOR_URI", ":8787"),
            ("OPERATOR_URI", "operator:http"),
            ("APPLICATION_URI", "0.0.0.0"),
        ] {
            let res = config(&[("EDGE_TRAIN_CMD", "train"), (key, value)]);
            assert!(matches!(res, Err(EdgeErr::Config(_))), "{key}={value}");
        }
    }

    #[test]
    fn zero_connections_are_rejected() {
        let res = config(&[("EDGE_TRAIN_CMD", "train"), ("EDGE_MAX_CONNECTIONS", "0")]);
        assert!(res.is_err());
    }
}
