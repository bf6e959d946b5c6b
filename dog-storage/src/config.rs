use std::time::Duration;

use crate::hash::{
    ChunkCrc32cHashFunction, CompositeHashFunction, Crc32cHashFunction, HashFunction,
    Md5HashFunction, NullHashFunction,
};
use crate::policy::{LimitedErrorCountResumePolicy, ResumePolicy};
use crate::{StorageError, StorageResult};

/// Configuration for streaming reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Bound on how long a stream may take to start (`None` disables it)
    pub start_timeout: Option<Duration>,

    /// Bound on each read from a stream
    pub read_timeout: Option<Duration>,

    /// Bound on each write to a stream
    pub write_timeout: Option<Duration>,

    /// Buffered writers keep up to this many bytes for the final flush of a drain
    pub buffer_low_watermark: usize,

    /// Buffered writers drain once this many bytes are buffered
    pub buffer_high_watermark: usize,

    /// Transient failures a reader may resume from
    pub max_resumes: u32,

    pub enable_crc32c_validation: bool,

    pub enable_md5_validation: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            start_timeout: Some(Duration::from_secs(60)),
            read_timeout: Some(Duration::from_secs(60)),
            write_timeout: Some(Duration::from_secs(60)),
            buffer_low_watermark: 4 * 1024 * 1024,   // 4MB
            buffer_high_watermark: 16 * 1024 * 1024, // 16MB
            max_resumes: 5,
            enable_crc32c_validation: true,
            enable_md5_validation: false,
        }
    }
}

impl StreamConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set both buffer watermarks
    pub fn with_watermarks(mut self, low: usize, high: usize) -> Self {
        self.buffer_low_watermark = low;
        self.buffer_high_watermark = high;
        self
    }

    pub fn with_max_resumes(mut self, resumes: u32) -> Self {
        self.max_resumes = resumes;
        self
    }

    pub fn with_crc32c_validation(mut self, enabled: bool) -> Self {
        self.enable_crc32c_validation = enabled;
        self
    }

    pub fn with_md5_validation(mut self, enabled: bool) -> Self {
        self.enable_md5_validation = enabled;
        self
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.buffer_low_watermark >= self.buffer_high_watermark {
            return Err(StorageError::config(format!(
                "low watermark {} must be below high watermark {}",
                self.buffer_low_watermark, self.buffer_high_watermark
            )));
        }
        Ok(())
    }

    /// Hash function matching the enabled validations
    pub fn hash_function(&self) -> Box<dyn HashFunction> {
        match (self.enable_crc32c_validation, self.enable_md5_validation) {
            (true, true) => Box::new(CompositeHashFunction::new(
                Box::new(Crc32cHashFunction::new()),
                Box::new(Md5HashFunction::new()),
            )),
            (true, false) => Box::new(Crc32cHashFunction::new()),
            (false, true) => Box::new(Md5HashFunction::new()),
            (false, false) => Box::new(NullHashFunction),
        }
    }

    /// Hash function for a ranged read, which can only check chunks
    pub fn range_hash_function(&self) -> Box<dyn HashFunction> {
        if self.enable_crc32c_validation {
            Box::new(ChunkCrc32cHashFunction)
        } else {
            Box::new(NullHashFunction)
        }
    }

    pub fn resume_policy(&self) -> Box<dyn ResumePolicy> {
        Box::new(LimitedErrorCountResumePolicy::new(self.max_resumes))
    }

    /// Load overrides from `PREFIX__KEY` environment variables, e.g.
    /// `DOG_STORAGE__READ_TIMEOUT_MS=5000`
    pub fn from_env(prefix: &str) -> StorageResult<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Same as [`StreamConfig::from_env`] over an explicit variable list
    pub fn from_vars<I>(prefix: &str, vars: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        let prefix = format!("{}__", prefix);

        for (key, value) in vars {
            let Some(stripped) = key.strip_prefix(&prefix) else {
                continue;
            };
            match stripped.to_lowercase().as_str() {
                "start_timeout_ms" => config.start_timeout = parse_timeout(&key, &value)?,
                "read_timeout_ms" => config.read_timeout = parse_timeout(&key, &value)?,
                "write_timeout_ms" => config.write_timeout = parse_timeout(&key, &value)?,
                "low_watermark" => config.buffer_low_watermark = parse(&key, &value)?,
                "high_watermark" => config.buffer_high_watermark = parse(&key, &value)?,
                "max_resumes" => config.max_resumes = parse(&key, &value)?,
                "crc32c" => config.enable_crc32c_validation = parse(&key, &value)?,
                "md5" => config.enable_md5_validation = parse(&key, &value)?,
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> StorageResult<T> {
    value
        .parse::<T>()
        .map_err(|_| StorageError::config(format!("cannot parse {}={}", key, value)))
}

/// `0` disables the timeout
fn parse_timeout(key: &str, value: &str) -> StorageResult<Option<Duration>> {
    let millis: u64 = parse(key, value)?;
    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}
