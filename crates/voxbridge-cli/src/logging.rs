use tracing_subscriber::EnvFilter;

use voxbridge_core::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level and filters.
pub fn init(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(config, verbose)?,
    };

    let json = config.format == "json";
    let stdout = config.output == "stdout";
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).try_init(),
        (true, false) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, true) => builder.with_writer(std::io::stdout).try_init(),
        (false, false) => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))
}

fn build_filter(config: &LoggingConfig, verbose: bool) -> anyhow::Result<EnvFilter> {
    let level = match &config.level {
        Some(level) => level.as_str(),
        None if verbose => "debug",
        None => "info",
    };

    let mut filter = EnvFilter::try_new(level)?;
    for directive in &config.filters {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_config() {
        let config = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["voxbridge_relay=trace".into()],
            ..LoggingConfig::default()
        };
        let filter = build_filter(&config, true).unwrap().to_string();
        assert!(filter.contains("warn"));
        assert!(filter.contains("voxbridge_relay=trace"));
    }

    #[test]
    fn test_verbose_default_level() {
        let filter = build_filter(&LoggingConfig::default(), true).unwrap();
        assert!(filter.to_string().contains("debug"));
    }

    #[test]
    fn test_bad_directive_is_error() {
        let config = LoggingConfig {
            filters: vec!["voxbridge_relay=loud".into()],
            ..LoggingConfig::default()
        };
        assert!(build_filter(&config, false).is_err());
    }
}
