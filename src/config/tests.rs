use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_resolve_without_any_source() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(settings.cache.root, PathBuf::from("cache"));
    assert_eq!(settings.cache.max_age_seconds, 86_400);
    assert_eq!(settings.cache.country_header, "cf-ipcountry");
    assert!(settings.origin.upstream_url.is_none());
    assert!(!settings.rate_limit.enabled);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn cache_root_override_applies_to_purge() {
    let mut raw = RawSettings::default();
    raw.apply_cache_root_override(&CacheRootOverride {
        cache_root: Some(PathBuf::from("/var/cache/pages")),
    });
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.root, PathBuf::from("/var/cache/pages"));
}

#[test]
fn zero_max_age_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.max_age_seconds = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero max age");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.max_age_seconds",
            ..
        }
    ));
}

#[test]
fn special_countries_are_normalized_and_validated() {
    let mut raw = RawSettings::default();
    raw.cache.special_countries = Some(vec!["de".to_string(), " fr ".to_string()]);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.special_countries, vec!["DE", "FR"]);

    let mut raw = RawSettings::default();
    raw.cache.special_countries = Some(vec!["EUR".to_string()]);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn invalid_country_header_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.country_header = Some("not a header".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn upstream_url_must_be_http() {
    let mut raw = RawSettings::default();
    raw.origin.upstream_url = Some("ftp://origin.internal".to_string());
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.origin.upstream_url = Some("http://127.0.0.1:8080".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.origin.upstream_url.map(|url| url.to_string()),
        Some("http://127.0.0.1:8080/".to_string())
    );
}

#[test]
fn blank_upstream_url_counts_as_missing() {
    let mut raw = RawSettings::default();
    raw.origin.upstream_url = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.origin.upstream_url.is_none());
}

#[test]
fn zero_rate_limit_window_is_rejected() {
    let mut raw = RawSettings::default();
    raw.rate_limit.window_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["pagecache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "pagecache",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--origin-url",
        "http://origin.internal",
        "--cache-permissive",
        "true",
        "--rate-limit-enabled",
        "yes",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(
                serve.overrides.origin_url.as_deref(),
                Some("http://origin.internal")
            );
            assert_eq!(serve.overrides.cache_permissive, Some(true));
            assert_eq!(serve.overrides.rate_limit_enabled, Some(true));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_purge_arguments() {
    let args = CliArgs::parse_from(["pagecache", "purge", "--cache-root", "/tmp/pages"]);

    match args.command.expect("purge command") {
        Command::Purge(purge) => {
            assert_eq!(
                purge.cache.cache_root.as_deref(),
                Some(std::path::Path::new("/tmp/pages"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_access_count_arguments() {
    let args = CliArgs::parse_from(["pagecache", "access-count", "--ip", "192.0.2.1"]);

    match args.command.expect("access-count command") {
        Command::AccessCount(count) => {
            assert_eq!(count.ip, "192.0.2.1");
            assert_eq!(count.window, DEFAULT_ACCESS_WINDOW_SECS);
        }
        _ => panic!("wrong command parsed"),
    }
}
