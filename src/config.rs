//! Heap configuration.
//!
//! Options can be given programmatically or as a `key:value,key:value` string,
//! which is what `ARENALLOC_CONF` carries for the global allocator:
//!
//! ```text
//! ARENALLOC_CONF="narenas:8,lg_chunk:21,dss:primary,retain:2,abort:false"
//! ```

use crate::error::ConfigError;
use crate::os;

/// Environment variable read by [`Config::from_env`].
pub const ENV_VAR: &str = "ARENALLOC_CONF";

/// Upper bound on arenas; arena ids are packed into extent nodes.
pub const MAX_ARENAS: usize = 4096;

const DEFAULT_LG_CHUNK: u32 = 22; // 4 MiB
const MAX_LG_CHUNK: u32 = 30;
const DEFAULT_MAX_SMALL: usize = 3584;
const DEFAULT_TCACHE_MAX: usize = 32 * 1024;

/// Order in which chunk backends are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DssPrecedence {
  /// Anonymous mappings only.
  Disabled,
  /// Grow the data segment first, fall back to mmap.
  Primary,
  /// mmap first, fall back to the data segment.
  #[default]
  Secondary,
}

/// What an arena does with a chunk that has become completely empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
  /// Return every empty chunk to the chunk manager immediately.
  Release,
  /// Keep up to this many empty chunks resident per arena.
  Spare(usize),
  /// Never return chunks while the heap lives.
  Retain,
}

impl Default for RetentionPolicy {
  fn default() -> Self {
    Self::Spare(1)
  }
}

/// Reaction to a free of an unknown pointer or a double free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MisusePolicy {
  /// Log and abort the process.
  #[default]
  Abort,
  /// Log and leave the heap untouched.
  Ignore,
}

/// How a thread is bound to an arena on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArenaAssignment {
  #[default]
  RoundRobin,
  /// Arena with the fewest bound threads, lowest id on ties.
  LeastLoaded,
  /// Arena indexed by the CPU the thread first runs on.
  CpuAffine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// log2 of the chunk size.
  pub lg_chunk: u32,
  /// Largest size served by bitmap runs. Rounded up to a class boundary.
  pub max_small: usize,
  /// Arena count; 0 selects four per online CPU.
  pub narenas: usize,
  pub assignment: ArenaAssignment,
  pub dss: DssPrecedence,
  pub retention: RetentionPolicy,
  /// Purge the pages of retained empty chunks.
  pub purge: bool,
  /// Give each thread handle a cache.
  pub tcache: bool,
  /// Largest size kept in thread caches.
  pub tcache_max: usize,
  /// Upper bound on cached entries per small class.
  pub tcache_slots_small: usize,
  /// Cached entries per large class.
  pub tcache_slots_large: usize,
  /// A cache miss fills `capacity / tcache_fill_div` regions.
  pub tcache_fill_div: usize,
  /// Cache events per full GC sweep over all bins; 0 disables GC.
  pub tcache_gc_sweep: u32,
  pub on_misuse: MisusePolicy,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      lg_chunk: DEFAULT_LG_CHUNK,
      max_small: DEFAULT_MAX_SMALL,
      narenas: 0,
      assignment: ArenaAssignment::default(),
      dss: DssPrecedence::default(),
      retention: RetentionPolicy::default(),
      purge: true,
      tcache: true,
      tcache_max: DEFAULT_TCACHE_MAX,
      tcache_slots_small: 200,
      tcache_slots_large: 20,
      tcache_fill_div: 2,
      tcache_gc_sweep: 8192,
      on_misuse: MisusePolicy::default(),
    }
  }
}

impl Config {
  pub fn chunk_size(&self) -> usize {
    1 << self.lg_chunk
  }

  /// Number of arenas the registry will create.
  pub fn arena_count(&self) -> usize {
    if self.narenas == 0 {
      (4 * os::ncpus()).clamp(1, MAX_ARENAS)
    } else {
      self.narenas
    }
  }

  /// Reads [`ENV_VAR`]. An unset variable yields the defaults.
  pub fn from_env() -> Result<Self, ConfigError> {
    match std::env::var(ENV_VAR) {
      Ok(raw) => Self::parse(&raw),
      Err(std::env::VarError::NotPresent) => Ok(Self::default()),
      Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
        key: ENV_VAR.to_owned(),
        value: "<non-unicode>".to_owned(),
      }),
    }
  }

  /// Parses `key:value` pairs separated by commas on top of the defaults.
  pub fn parse(input: &str) -> Result<Self, ConfigError> {
    let mut config = Self::default();
    for entry in input.split(',').map(str::trim).filter(|e| !e.is_empty()) {
      let (key, value) = entry
        .split_once(':')
        .ok_or_else(|| ConfigError::UnknownKey(entry.to_owned()))?;
      config.set(key.trim(), value.trim())?;
    }
    Ok(config)
  }

  fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidValue {
      key: key.to_owned(),
      value: value.to_owned(),
    };
    let number = || value.parse::<usize>().map_err(|_| invalid());
    let flag = || match value {
      "true" | "1" | "yes" => Ok(true),
      "false" | "0" | "no" => Ok(false),
      _ => Err(invalid()),
    };

    match key {
      "lg_chunk" => self.lg_chunk = value.parse().map_err(|_| invalid())?,
      "max_small" => self.max_small = number()?,
      "narenas" => self.narenas = number()?,
      "assignment" => {
        self.assignment = match value {
          "round_robin" | "rr" => ArenaAssignment::RoundRobin,
          "least_loaded" => ArenaAssignment::LeastLoaded,
          "cpu" | "percpu" => ArenaAssignment::CpuAffine,
          _ => return Err(invalid()),
        }
      }
      "dss" => {
        self.dss = match value {
          "disabled" => DssPrecedence::Disabled,
          "primary" => DssPrecedence::Primary,
          "secondary" => DssPrecedence::Secondary,
          _ => return Err(invalid()),
        }
      }
      "retain" => {
        self.retention = match value {
          "release" | "none" => RetentionPolicy::Release,
          "all" => RetentionPolicy::Retain,
          n => RetentionPolicy::Spare(n.parse().map_err(|_| invalid())?),
        }
      }
      "purge" => self.purge = flag()?,
      "tcache" => self.tcache = flag()?,
      "tcache_max" => self.tcache_max = number()?,
      "tcache_slots_small" => self.tcache_slots_small = number()?,
      "tcache_slots_large" => self.tcache_slots_large = number()?,
      "tcache_fill_div" => self.tcache_fill_div = number()?,
      "tcache_gc_sweep" => self.tcache_gc_sweep = value.parse().map_err(|_| invalid())?,
      "abort" => {
        self.on_misuse = if flag()? {
          MisusePolicy::Abort
        } else {
          MisusePolicy::Ignore
        }
      }
      _ => return Err(ConfigError::UnknownKey(key.to_owned())),
    }
    Ok(())
  }

  /// Checks the options against each other and the page size.
  pub fn validate(&self, page_size: usize) -> Result<(), ConfigError> {
    let lg_page = page_size.trailing_zeros();
    if self.lg_chunk < lg_page + 2 || self.lg_chunk > MAX_LG_CHUNK {
      return Err(ConfigError::OutOfRange {
        key: "lg_chunk",
        reason: "chunks must span at least four pages and at most 1 GiB",
      });
    }
    if self.max_small < 16 || self.max_small > 16 * page_size {
      return Err(ConfigError::OutOfRange {
        key: "max_small",
        reason: "must be between 16 bytes and sixteen pages",
      });
    }
    if self.max_small * 4 > self.chunk_size() {
      return Err(ConfigError::OutOfRange {
        key: "max_small",
        reason: "must be at most a quarter of the chunk size",
      });
    }
    if self.narenas > MAX_ARENAS {
      return Err(ConfigError::OutOfRange {
        key: "narenas",
        reason: "at most 4096 arenas",
      });
    }
    if self.tcache_max >= self.chunk_size() || self.tcache_max / page_size > usize::from(u16::MAX) {
      return Err(ConfigError::OutOfRange {
        key: "tcache_max",
        reason: "must be smaller than the chunk size",
      });
    }
    if self.tcache_slots_small < 2 || self.tcache_slots_large < 2 {
      return Err(ConfigError::OutOfRange {
        key: "tcache_slots",
        reason: "caches need room for at least two entries",
      });
    }
    if self.tcache_fill_div == 0 {
      return Err(ConfigError::OutOfRange {
        key: "tcache_fill_div",
        reason: "must be non-zero",
      });
    }
    if let RetentionPolicy::Spare(n) = self.retention
      && n > 1 << 16
    {
      return Err(ConfigError::OutOfRange {
        key: "retain",
        reason: "spare chunk count is unreasonably large",
      });
    }
    Ok(())
  }
}
