/// Runtime options. Pool sizes default to the production shape: loaders are
/// sized by database/API connection limits, processors by revert volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub debug: bool,
    pub trace: bool,
    pub debug_metrics: bool,
    pub irc_relay: bool,
    pub no_replication_check: bool,
    pub processors: usize,
    pub sql_loaders: usize,
    pub http_loaders: usize,
    /// Single-edit mode: process exactly this revision id instead of the
    /// live feed.
    pub process_id: Option<i64>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            debug: false,
            trace: false,
            debug_metrics: false,
            irc_relay: false,
            no_replication_check: false,
            processors: 20,
            sql_loaders: 150,
            http_loaders: 150,
            process_id: None,
        }
    }
}

impl Options {
    pub fn log_level(&self) -> &'static str {
        if self.trace {
            "trace"
        } else if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

pub fn parse_args<I>(mut args: I) -> Result<Options, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let mut options = Options::default();
    while let Some(arg) = args.next() {
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };

        let mut value_for = |flag: &str| -> Result<String, String> {
            match inline_value.clone() {
                Some(v) => Ok(v),
                None => args.next().ok_or_else(|| format!("{flag} needs a value")),
            }
        };

        match flag.as_str() {
            "--debug" => options.debug = true,
            "--trace" => options.trace = true,
            "--debug-metrics" => options.debug_metrics = true,
            "--irc-relay" => options.irc_relay = true,
            "--no-replication-check" => options.no_replication_check = true,
            "--processors" => {
                options.processors = parse_count(&flag, &value_for("--processors")?)?;
            }
            "--sql-loaders" => {
                options.sql_loaders = parse_count(&flag, &value_for("--sql-loaders")?)?;
            }
            "--http-loaders" => {
                options.http_loaders = parse_count(&flag, &value_for("--http-loaders")?)?;
            }
            "--process-id" => {
                let raw = value_for("--process-id")?;
                let id = raw
                    .parse::<i64>()
                    .map_err(|_| format!("--process-id: not a revision id: {raw}"))?;
                options.process_id = Some(id);
            }
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    Ok(options)
}

fn parse_count(flag: &str, raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("{flag}: not a positive count: {raw}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Options, String> {
        let mut full = vec!["patrol".to_string()];
        full.extend(args.iter().map(ToString::to_string));
        parse_args(full.into_iter())
    }

    #[test]
    fn test_defaults() {
        let options = parse(&[]).unwrap();
        assert_eq!(options, Options::default());
        assert_eq!(options.processors, 20);
        assert_eq!(options.sql_loaders, 150);
        assert_eq!(options.http_loaders, 150);
        assert_eq!(options.log_level(), "info");
    }

    #[test]
    fn test_bool_flags() {
        let options =
            parse(&["--debug", "--irc-relay", "--no-replication-check", "--debug-metrics"])
                .unwrap();
        assert!(options.debug);
        assert!(options.irc_relay);
        assert!(options.no_replication_check);
        assert!(options.debug_metrics);
        assert_eq!(options.log_level(), "debug");
    }

    #[test]
    fn test_trace_wins_over_debug() {
        let options = parse(&["--debug", "--trace"]).unwrap();
        assert_eq!(options.log_level(), "trace");
    }

    #[test]
    fn test_counts_separate_and_inline() {
        let options = parse(&["--processors", "4", "--sql-loaders=9"]).unwrap();
        assert_eq!(options.processors, 4);
        assert_eq!(options.sql_loaders, 9);
    }

    #[test]
    fn test_process_id() {
        let options = parse(&["--process-id", "1234567"]).unwrap();
        assert_eq!(options.process_id, Some(1234567));
    }

    #[test]
    fn test_rejects_unknown_flag_and_bad_values() {
        assert!(parse(&["--wat"]).is_err());
        assert!(parse(&["--processors", "zero"]).is_err());
        assert!(parse(&["--processors", "0"]).is_err());
        assert!(parse(&["--process-id"]).is_err());
    }
}
