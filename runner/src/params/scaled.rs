use crate::config::ConfigError;

/// An integer parameter that is searched on a normalized, linear scale but
/// stored without scaling.
///
/// A search step of one corresponds to `scale / RESOLUTION` in the true
/// domain, so huge memory ranges stay searchable and tiny scales still move
/// the rendered value. Converting back rounds to the nearest integer: the
/// composition `to_true_domain(to_search_domain(v))` can be off by one and
/// can leave `[min, max]` at the edges. `legal_range` truncates instead of
/// rounding so the search bounds themselves never grow.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledIntegerParameter {
    name: String,
    min: i64,
    max: i64,
    scale: i64,
}

impl ScaledIntegerParameter {
    pub const RESOLUTION: i64 = 1000;

    pub fn new(name: impl Into<String>, min: i64, max: i64, scale: i64) -> Result<Self, ConfigError> {
        let name = name.into();
        let invalid = |reason: &str| ConfigError::InvalidScale {
            name: name.clone(),
            min,
            max,
            scale,
            reason: reason.to_string(),
        };

        if scale == 0 {
            return Err(invalid("scale must not be zero"));
        }
        if scale.unsigned_abs() > min.unsigned_abs() {
            return Err(invalid("scale must not exceed the range start in magnitude"));
        }
        if min == max {
            return Err(invalid("range must not be empty"));
        }
        if (max - min).signum() != scale.signum() {
            return Err(invalid("scale sign must follow the range direction"));
        }

        Ok(Self {
            name,
            min,
            max,
            scale,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min(&self) -> i64 {
        self.min
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    pub fn scale(&self) -> i64 {
        self.scale
    }

    pub fn to_search_domain(&self, value: i64) -> f64 {
        (value - self.min) as f64 * Self::RESOLUTION as f64 / self.scale as f64
    }

    pub fn to_true_domain(&self, value: i64) -> i64 {
        (value as f64 * self.scale as f64 / Self::RESOLUTION as f64).round() as i64 + self.min
    }

    /// search-domain bounds, truncated towards zero
    pub fn legal_range(&self) -> (i64, i64) {
        (
            self.to_search_domain(self.min) as i64,
            self.to_search_domain(self.max) as i64,
        )
    }

    pub fn search_space_size(&self) -> u64 {
        let (low, high) = self.legal_range();

        high.abs_diff(low) + 1
    }
}
