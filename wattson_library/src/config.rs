#[macro_export]
/// A macro to enable injecting compile-time configuration that will be used at load time.
/// Will still load from file and environment that override the defaults.
///
/// # Example
/// ```
/// #[derive(serde::Deserialize)]
/// struct CustomConfig {
///
/// }
/// pub fn new(
///     config_fpath: Option<&str>,
///     overrides: Option<Vec<(String, String)>>,
/// ) -> anyhow::Result<CustomConfig> {
///     wattson_library::load_config_default!(
///             "wattson_library/src/monitor.json",
///             config_fpath,
///             overrides,
///             "WATTSON"
///         )
/// }
/// ```
macro_rules! load_config_default {
    ($defaults_json_file:literal, $overrides_config_fpath:ident, $overrides:ident, $env_prefix:expr) => {{
        let defaults = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../", $defaults_json_file));
        $crate::config::load_config(Some(defaults), $overrides_config_fpath, $overrides, $env_prefix)
    }};
}

/// Layer defaults, an optional file, the environment, then explicit overrides; later sources win.
pub fn load_config<T>(
    default_json: Option<&str>,
    overrides_config_fpath: Option<&str>,
    overrides: Option<Vec<(String, String)>>,
    env_prefix: &str,
) -> anyhow::Result<T>
where
    T: for<'a> serde::Deserialize<'a>,
{
    let mut builder = config::Config::builder();
    if let Some(default_json) = default_json {
        builder = builder.add_source(config::File::from_str(default_json, config::FileFormat::Json));
    }
    if let Some(config_fpath) = overrides_config_fpath {
        if std::path::Path::new(&config_fpath).exists() {
            builder = builder.add_source(config::File::with_name(config_fpath));
        } else {
            anyhow::bail!("Configuration file '{}' does not exist", config_fpath);
        }
    }
    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .try_parsing(true)
            .separator("__")
            .prefix_separator("__"),
    );
    if let Some(overrides) = overrides {
        for (k, v) in overrides {
            builder = match builder.set_override(&k, v.clone()) {
                Ok(s) => s,
                Err(e) => {
                    anyhow::bail!("Failed to set override '{}' to '{}' because {}", k, v, e)
                },
            };
        }
    }
    match builder.build() {
        Ok(s) => match s.try_deserialize() {
            Ok(cfg) => Ok(cfg),
            Err(e) => anyhow::bail!("Failed to deserialize configuration because '{}'", e),
        },
        Err(e) => anyhow::bail!("Failed to build configuration because '{}'", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Deserialize)]
    struct Inner {
        period: f64,
        name: String,
    }
    #[derive(serde::Deserialize)]
    struct Outer {
        inner: Inner,
    }

    #[test]
    fn overrides_beat_defaults() {
        let defaults = r#"{"inner": {"period": 1.0, "name": "a"}}"#;
        let cfg: Outer = load_config(
            Some(defaults),
            None,
            Some(vec![("inner.period".to_string(), "0.25".to_string())]),
            "WATTSON_CONFIG_TEST",
        )
        .unwrap();
        assert_eq!(cfg.inner.period, 0.25);
        assert_eq!(cfg.inner.name, "a");
    }

    #[test]
    fn missing_file_is_error() {
        let r: anyhow::Result<Outer> = load_config(None, Some("/nonexistent/wattson.json"), None, "WATTSON_CONFIG_TEST");
        assert!(r.is_err());
    }
}
