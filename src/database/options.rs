use std::time::Duration;

use crate::common::{
    Error, Result, CACHE_SCALE_RANGE, CACHE_SIZE_SCALE_RANGE, DEFAULT_EVICTION_BIAS_DIVISOR,
};
use crate::log::LogFormat;
use crate::storage::DatabaseProperties;

/// Options supplied when opening a database.
///
/// Tuning values left unset keep whatever the properties file holds (or the
/// defaults for a new database); values that are set override it and are
/// written back.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    cache_scale: Option<u32>,
    cache_size_scale: Option<u32>,
    log_size_mb: Option<u32>,
    log_format: Option<LogFormat>,
    write_delay_secs: Option<u32>,
    read_only: bool,
    sync_tick: Duration,
    eviction_bias_divisor: usize,
    store_on_insert: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            cache_scale: None,
            cache_size_scale: None,
            log_size_mb: None,
            log_format: None,
            write_delay_secs: None,
            read_only: false,
            sync_tick: Duration::from_secs(1),
            eviction_bias_divisor: DEFAULT_EVICTION_BIAS_DIVISOR,
            store_on_insert: false,
        }
    }
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket-count exponent; the cache holds `3 << scale` rows.
    pub fn cache_scale(mut self, scale: u32) -> Self {
        self.cache_scale = Some(scale);
        self
    }

    /// Average-row-size exponent used for the byte budget.
    pub fn cache_size_scale(mut self, scale: u32) -> Self {
        self.cache_size_scale = Some(scale);
        self
    }

    /// Log size in MiB that forces a checkpoint; 0 disables it.
    pub fn log_size_mb(mut self, mb: u32) -> Self {
        self.log_size_mb = Some(mb);
        self
    }

    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    /// Ticks of the sync task between log syncs.
    pub fn write_delay_secs(mut self, secs: u32) -> Self {
        self.write_delay_secs = Some(secs);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Period of the background sync task.
    pub fn sync_tick(mut self, tick: Duration) -> Self {
        self.sync_tick = tick;
        self
    }

    /// Extra share of rows dropped per eviction pass, as `resident / divisor`.
    pub fn eviction_bias_divisor(mut self, divisor: usize) -> Self {
        self.eviction_bias_divisor = divisor;
        self
    }

    /// Write each row to disk as soon as it is added.
    pub fn store_on_insert(mut self, enabled: bool) -> Self {
        self.store_on_insert = enabled;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn get_sync_tick(&self) -> Duration {
        self.sync_tick
    }

    pub fn get_eviction_bias_divisor(&self) -> usize {
        self.eviction_bias_divisor
    }

    pub fn get_store_on_insert(&self) -> bool {
        self.store_on_insert
    }

    /// Checks every explicitly set value against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if let Some(scale) = self.cache_scale {
            check_range("cache_scale", scale, CACHE_SCALE_RANGE)?;
        }
        if let Some(scale) = self.cache_size_scale {
            check_range("cache_size_scale", scale, CACHE_SIZE_SCALE_RANGE)?;
        }
        if self.eviction_bias_divisor == 0 {
            return Err(Error::InvalidConfig {
                name: "eviction_bias_divisor",
                value: 0,
                min: 1,
                max: u32::MAX,
            });
        }
        if self.sync_tick.is_zero() {
            return Err(Error::InvalidConfig {
                name: "sync_tick_ms",
                value: 0,
                min: 1,
                max: u32::MAX,
            });
        }
        Ok(())
    }

    /// Copies the explicitly set tuning values into `props`.
    /// Returns true if anything changed.
    pub fn apply_to(&self, props: &mut DatabaseProperties) -> bool {
        let before = props.clone();
        if let Some(v) = self.cache_scale {
            props.cache.scale = v;
        }
        if let Some(v) = self.cache_size_scale {
            props.cache.size_scale = v;
        }
        if let Some(v) = self.log_size_mb {
            props.log.size_mb = v;
        }
        if let Some(v) = self.log_format {
            props.log.format = v;
        }
        if let Some(v) = self.write_delay_secs {
            props.log.write_delay_secs = v;
        }
        *props != before
    }
}

/// Rejects stored properties that are out of range, e.g. after a hand edit.
pub fn validate_properties(props: &DatabaseProperties) -> Result<()> {
    check_range("cache_scale", props.cache.scale, CACHE_SCALE_RANGE)?;
    check_range("cache_size_scale", props.cache.size_scale, CACHE_SIZE_SCALE_RANGE)
}

fn check_range(name: &'static str, value: u32, (min, max): (u32, u32)) -> Result<()> {
    if value < min || value > max {
        return Err(Error::InvalidConfig {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{DEFAULT_CACHE_SCALE, DEFAULT_LOG_SIZE_MB};

    #[test]
    fn test_defaults_validate() {
        DatabaseOptions::new().validate().unwrap();
    }

    #[test]
    fn test_out_of_range() {
        let err = DatabaseOptions::new().cache_scale(3).validate().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidConfig {
                name: "cache_scale",
                value: 3,
                min: 8,
                max: 18
            }
        ));
        assert!(DatabaseOptions::new().cache_size_scale(21).validate().is_err());
        assert!(DatabaseOptions::new().cache_size_scale(6).validate().is_ok());
        assert!(DatabaseOptions::new().eviction_bias_divisor(0).validate().is_err());
    }

    #[test]
    fn test_apply_only_set_values() {
        let mut props = DatabaseProperties::new("/tmp/unused.properties");
        assert!(!DatabaseOptions::new().apply_to(&mut props));

        let changed = DatabaseOptions::new()
            .cache_size_scale(8)
            .log_format(LogFormat::Binary)
            .apply_to(&mut props);
        assert!(changed);
        assert_eq!(props.cache.scale, DEFAULT_CACHE_SCALE);
        assert_eq!(props.cache.size_scale, 8);
        assert_eq!(props.log.size_mb, DEFAULT_LOG_SIZE_MB);
        assert_eq!(props.log.format, LogFormat::Binary);
    }

    #[test]
    fn test_stored_properties_checked() {
        let mut props = DatabaseProperties::new("/tmp/unused.properties");
        validate_properties(&props).unwrap();
        props.cache.scale = 30;
        assert!(validate_properties(&props).is_err());
    }
}
