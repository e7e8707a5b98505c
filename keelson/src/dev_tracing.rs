//! Opt-in log output for demos, benches and tests.

use tracing_subscriber::EnvFilter;

/// Set to a level (`debug`, `trace`, ...) to log only keelson's own crates.
pub const LEVEL_VAR: &str = "KEELSON_LOG";

const CRATES: [&str; 3] = ["keelson", "keelson_core", "keelson_codec"];

/// Install a stderr subscriber that tags each line with the event loop
/// thread it came from.
///
/// `RUST_LOG` wins when set. Otherwise `KEELSON_LOG=<level>` turns on
/// keelson's crates at that level and leaves everything else quiet. With
/// neither set, an unparsable filter, or a subscriber already installed,
/// this does nothing.
pub fn init_tracing() {
    let rust_log = std::env::var("RUST_LOG").ok();
    let level = std::env::var(LEVEL_VAR).ok();
    let Some(filter) = directives(rust_log, level).and_then(|d| EnvFilter::try_new(d).ok()) else {
        return;
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn directives(rust_log: Option<String>, level: Option<String>) -> Option<String> {
    if let Some(rust_log) = rust_log.filter(|d| !d.trim().is_empty()) {
        return Some(rust_log);
    }
    let level = level?;
    let level = level.trim();
    if level.is_empty() {
        return None;
    }
    Some(
        CRATES
            .iter()
            .map(|krate| format!("{krate}={level}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_takes_precedence() {
        assert_eq!(
            directives(Some("warn".into()), Some("trace".into())).as_deref(),
            Some("warn")
        );
    }

    #[test]
    fn level_var_scopes_to_keelson_crates() {
        let d = directives(None, Some(" debug ".into())).unwrap();
        assert_eq!(d, "keelson=debug,keelson_core=debug,keelson_codec=debug");
        assert!(EnvFilter::try_new(d).is_ok());
    }

    #[test]
    fn nothing_set_means_no_subscriber() {
        assert_eq!(directives(None, None), None);
        assert_eq!(directives(Some(" ".into()), Some(String::new())), None);
    }
}
