use serde::Deserialize;

use crate::classification::ClassificationSettings;
use crate::config::ConfigErr;
use crate::consts::{HISTOGRAM_BINS, TOP_RATES_LIMIT};
use crate::loader::LoaderSettings;
use crate::merger::MergeSettings;
use crate::storage::clickhouse::ClickhouseSettings;

fn default_histogram_bins() -> usize {
    HISTOGRAM_BINS
}

fn default_top_rates_limit() -> usize {
    TOP_RATES_LIMIT
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReportingSettings {
    #[serde(default = "default_histogram_bins")]
    pub histogram_bins: usize,
    #[serde(default = "default_top_rates_limit")]
    pub top_rates_limit: usize,
}

impl Default for ReportingSettings {
    fn default() -> Self {
        Self {
            histogram_bins: default_histogram_bins(),
            top_rates_limit: default_top_rates_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Configuration {
    pub clickhouse: ClickhouseSettings,

    #[serde(default)]
    pub loader: LoaderSettings,

    #[serde(default)]
    pub merge: MergeSettings,

    #[serde(default)]
    pub classification: ClassificationSettings,

    #[serde(default)]
    pub reporting: ReportingSettings,
}

impl Configuration {
    /// Rejects values no component can run with.
    pub fn validate(&self) -> Result<(), ConfigErr> {
        if self.loader.batch_size == 0 || self.merge.batch_size == 0 {
            return Err(ConfigErr::Invalid(String::from(
                "batch sizes must be greater than zero",
            )));
        }
        if self.merge.timeout_limit_ms < 0 {
            return Err(ConfigErr::Invalid(format!(
                "merge.timeout_limit_ms must not be negative, got {}",
                self.merge.timeout_limit_ms
            )));
        }
        let k = self.classification.sigma_multiplier;
        if k.is_nan() || k <= 0.0 {
            return Err(ConfigErr::Invalid(format!(
                "classification.sigma_multiplier must be positive, got {k}"
            )));
        }
        let packets_k = self.classification.packets.sigma_multiplier;
        if packets_k.is_nan() || packets_k < 0.0 {
            return Err(ConfigErr::Invalid(format!(
                "classification.packets.sigma_multiplier must not be negative, got {packets_k}"
            )));
        }
        if self.reporting.histogram_bins == 0 {
            return Err(ConfigErr::Invalid(String::from(
                "reporting.histogram_bins must be greater than zero",
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureSettings;
    use crate::classification::RateHigh;
    use crate::config::ConfigCache;
    use crate::merger::VolumePolicy;
    use crate::storage::PopulationFilter;
    use pretty_assertions::assert_eq;
    use serde_yaml;
    use serial_test::serial;
    use std::env;
    use std::io::Write;
    use std::path::PathBuf;
    use test_case::test_case;

    const CLICKHOUSE_YAML: &str = "
clickhouse:
  host: localhost
  port: 9000
  user: default
  password: secret
";

    fn clickhouse() -> ClickhouseSettings {
        ClickhouseSettings {
            host: String::from("localhost"),
            port: 9000,
            user: String::from("default"),
            password: String::from("secret"),
            database: String::from("default"),
            table: String::from("flows"),
        }
    }

    fn config_file(name: &str, content: &str) -> PathBuf {
        let path = env::temp_dir().join(format!(
            "reconstructor-settings-{}-{}.yaml",
            std::process::id(),
            name
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let cfg: Configuration = serde_yaml::from_str(CLICKHOUSE_YAML).unwrap();

        assert_eq!(
            cfg,
            Configuration {
                clickhouse: clickhouse(),
                loader: LoaderSettings::default(),
                merge: MergeSettings::default(),
                classification: ClassificationSettings::default(),
                reporting: ReportingSettings::default(),
            }
        );
        assert_eq!(cfg.merge.timeout_limit_ms, 20_000);
        assert_eq!(cfg.classification.min_packets, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_merge_section_deserialization() {
        let cfg: Configuration = serde_yaml::from_str(&format!(
            "{CLICKHOUSE_YAML}
merge:
  timeout_limit_ms: 15000
  volume_policy: accumulate
  base_capture: first
  captures:
    - name: first
      path: /data/first.txt
      start: \"1616749950.468\"
      end: \"1616750010.000\"
      preloaded: true
    - name: second
      path: /data/second.txt
      start: \"1616750000.000\"
      end: \"1616750060.000\"
"
        ))
        .unwrap();

        assert_eq!(cfg.merge.timeout_limit_ms, 15_000);
        assert_eq!(cfg.merge.volume_policy, VolumePolicy::Accumulate);
        assert_eq!(cfg.merge.base_capture, "first");
        assert_eq!(
            cfg.merge.captures,
            vec![
                CaptureSettings {
                    name: String::from("first"),
                    path: PathBuf::from("/data/first.txt"),
                    start: String::from("1616749950.468"),
                    end: String::from("1616750010.000"),
                    preloaded: true,
                },
                CaptureSettings {
                    name: String::from("second"),
                    path: PathBuf::from("/data/second.txt"),
                    start: String::from("1616750000.000"),
                    end: String::from("1616750060.000"),
                    preloaded: false,
                },
            ]
        );
    }

    #[test]
    #[serial]
    fn test_yaml_file_through_config_cache() {
        let path = config_file(
            "classification",
            &format!(
                "{CLICKHOUSE_YAML}
classification:
  sigma_multiplier: 2.5
  filter:
    min_bytes: 1
  packets:
    low_threshold_packets: 4
  rate:
    high:
      fixed: 279265.2
reporting:
  histogram_bins: 30
"
            ),
        );

        let cache = ConfigCache::new(path.to_str().unwrap()).unwrap();
        let cfg = cache.get_config::<Configuration>().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(cfg.classification.sigma_multiplier, 2.5);
        assert_eq!(
            cfg.classification.filter,
            PopulationFilter {
                min_bytes: Some(1),
                ..PopulationFilter::default()
            }
        );
        assert_eq!(cfg.classification.packets.low_threshold_packets, Some(4));
        assert_eq!(cfg.classification.packets.sigma_multiplier, 0.0);
        assert_eq!(cfg.classification.rate.high, RateHigh::Fixed(279_265.2));
        assert_eq!(cfg.reporting.histogram_bins, 30);
        assert_eq!(cfg.reporting.top_rates_limit, 10);
    }

    #[test_case("db1", "9000", "flows"; "default table")]
    #[test_case("clickhouse.internal", "19000", "flows_v2"; "custom table")]
    #[serial]
    fn test_env_configs(host: &str, port: &str, table: &str) {
        env::set_var("RECONSTRUCTOR__CLICKHOUSE__HOST", host);
        env::set_var("RECONSTRUCTOR__CLICKHOUSE__PORT", port);
        env::set_var("RECONSTRUCTOR__CLICKHOUSE__USER", "reader");
        env::set_var("RECONSTRUCTOR__CLICKHOUSE__PASSWORD", "pw");
        env::set_var("RECONSTRUCTOR__CLICKHOUSE__TABLE", table);
        env::set_var("RECONSTRUCTOR__MERGE__TIMEOUT_LIMIT_MS", "30000");

        // ConfigCache without configuration file
        let config_cache = ConfigCache::new("");

        for key in ["HOST", "PORT", "USER", "PASSWORD", "TABLE"] {
            env::remove_var(format!("RECONSTRUCTOR__CLICKHOUSE__{key}"));
        }
        env::remove_var("RECONSTRUCTOR__MERGE__TIMEOUT_LIMIT_MS");

        let cfg = match config_cache {
            Ok(cfg) => cfg,
            Err(e) => {
                assert!(false, "{:?}", e);
                return;
            }
        };
        let config = match cfg.get_config::<Configuration>() {
            Ok(c) => c,
            Err(e) => {
                assert!(false, "{:?}", e);
                return;
            }
        };

        assert_eq!(
            config.clickhouse,
            ClickhouseSettings {
                host: host.to_owned(),
                port: port.parse().unwrap(),
                user: String::from("reader"),
                password: String::from("pw"),
                database: String::from("default"),
                table: table.to_owned(),
            }
        );
        assert_eq!(config.merge.timeout_limit_ms, 30_000);
    }

    #[test]
    #[serial]
    fn test_missing_clickhouse_section_is_a_read_error() {
        let cache = ConfigCache::new("").unwrap();
        assert!(matches!(
            cache.get_config::<Configuration>(),
            Err(ConfigErr::Read(_))
        ));
    }

    #[test]
    #[serial]
    fn test_config_cache_validates() {
        let path = config_file(
            "invalid",
            &format!("{CLICKHOUSE_YAML}\nmerge:\n  batch_size: 0\n"),
        );

        let result = ConfigCache::new(path.to_str().unwrap()).and_then(|c| c.configuration());
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(ConfigErr::Invalid(_))));
    }

    #[test_case("loader:\n  batch_size: 0\n"; "zero loader batch")]
    #[test_case("merge:\n  timeout_limit_ms: -1\n"; "negative timeout")]
    #[test_case("classification:\n  sigma_multiplier: 0.0\n"; "zero sigma")]
    #[test_case("classification:\n  packets:\n    sigma_multiplier: -1.0\n"; "negative packets sigma")]
    #[test_case("reporting:\n  histogram_bins: 0\n"; "zero bins")]
    fn test_validation_rejects(section: &str) {
        let cfg: Configuration =
            serde_yaml::from_str(&format!("{CLICKHOUSE_YAML}{section}")).unwrap();

        assert!(matches!(cfg.validate(), Err(ConfigErr::Invalid(_))));
    }
}
