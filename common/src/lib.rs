// Copyright 2023 Oxide Computer Company
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::time::Duration;

use ErrorKind::NotFound;

use anyhow::{anyhow, bail, Context};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;

pub mod poll;
pub use poll::{PollOutcome, Poller};

pub type Result<T> = std::result::Result<T, SpareError>;

/*
 * The three ways a sparing orchestration step can fail.  Nothing here is
 * ever retried by the layer that reports it: precondition violations and
 * command failures are programming or environment errors, and a timeout
 * means the retry budget inside the wait loop is already spent.
 */
#[derive(Error, Debug)]
pub enum SpareError {
    /// The caller violated an invariant this layer enforces (hook already
    /// armed, source disk already recorded, illegal operation/checkpoint
    /// combination, batch too large).  Fatal to the test step.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A wait loop exhausted its retry budget.  Carries the identity of
    /// every raid group that never satisfied the predicate so the caller
    /// can dump a useful diagnostic.
    #[error(
        "timed out after {elapsed:?} waiting for {event}; \
         incomplete raid groups: {incomplete:?}"
    )]
    Timeout {
        event: String,
        elapsed: Duration,
        incomplete: Vec<Uuid>,
    },

    /// The controller rejected a command outright (as opposed to accepting
    /// it and then taking too long).  Propagated immediately.
    #[error("controller command failed: {0}")]
    CommandFailed(String),
}

/// Bail out of the current function with a `SpareError::Precondition`.
#[macro_export]
macro_rules! precondition_bail {
    ($($arg:tt)*) => {
        return Err($crate::SpareError::Precondition(
            format!($($arg)*)
        ).into())
    };
}

pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/*
 * Retry budgets for the two polling flavors.  The defaults reproduce the
 * historical limits: 1200 rounds of 100ms (two minutes) for status-derived
 * events, and 1200 rounds of 50ms (one minute) when we are only waiting
 * for a debug hook counter to tick over.
 */
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct WaitSettings {
    /// Poll rounds before a wait is declared dead.
    pub retries: u32,
    /// Sleep between rounds for status-derived events, in milliseconds.
    pub interval_ms: u64,
    /// Sleep between rounds when polling a hook hit counter.
    pub hook_interval_ms: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        WaitSettings {
            retries: 1200,
            interval_ms: 100,
            hook_interval_ms: 50,
        }
    }
}

impl WaitSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn hook_interval(&self) -> Duration {
        Duration::from_millis(self.hook_interval_ms)
    }

    pub fn read_from<P: AsRef<Path>>(file: P) -> anyhow::Result<Self> {
        match read_json_maybe(file.as_ref())? {
            Some(ws) => Ok(ws),
            None => bail!("settings file {:?} not found", file.as_ref()),
        }
    }

    pub fn write_to<P: AsRef<Path>>(&self, file: P) -> anyhow::Result<()> {
        write_json(file, self, true)
    }
}

pub fn read_json_maybe<P, T>(file: P) -> anyhow::Result<Option<T>>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let mut f = match File::open(file) {
        Ok(f) => f,
        Err(e) if e.kind() == NotFound => return Ok(None),
        Err(e) => bail!("open {:?}: {:?}", file, e),
    };
    let mut buf = Vec::<u8>::new();
    f.read_to_end(&mut buf)
        .with_context(|| anyhow!("read {:?}", file))?;
    Ok(serde_json::from_slice(buf.as_slice())
        .with_context(|| anyhow!("parse {:?}", file))?)
}

pub fn write_json<P, T>(file: P, data: &T, clobber: bool) -> anyhow::Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let mut buf = serde_json::to_vec_pretty(data)?;
    buf.push(b'\n');
    let mut tmpf = NamedTempFile::new_in(file.parent().unwrap())?;
    tmpf.write_all(&buf)?;
    tmpf.flush()?;

    if clobber {
        tmpf.persist(file)?;
    } else {
        tmpf.persist_noclobber(file)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn settings_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wait.json");

        let ws = WaitSettings {
            retries: 7,
            interval_ms: 3,
            hook_interval_ms: 1,
        };
        ws.write_to(&path).unwrap();
        let back = WaitSettings::read_from(&path).unwrap();
        assert_eq!(ws, back);
    }

    #[test]
    fn settings_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.json");
        assert!(WaitSettings::read_from(&path).is_err());
    }

    #[test]
    fn default_budgets() {
        let ws = WaitSettings::default();
        assert_eq!(ws.retries, 1200);
        assert_eq!(ws.interval(), Duration::from_millis(100));
        assert_eq!(ws.hook_interval(), Duration::from_millis(50));
    }

    #[test_strategy::proptest]
    fn wait_settings_json_round_trip(
        #[strategy(0u32..100_000)] retries: u32,
        #[strategy(0u64..100_000)] interval_ms: u64,
        #[strategy(0u64..100_000)] hook_interval_ms: u64,
    ) {
        let ws = WaitSettings {
            retries,
            interval_ms,
            hook_interval_ms,
        };
        let s = serde_json::to_string(&ws).unwrap();
        let back: WaitSettings = serde_json::from_str(&s).unwrap();
        assert_eq!(ws, back);
    }

    #[test]
    fn precondition_bail_formats() {
        fn f() -> Result<()> {
            precondition_bail!("slot {} busy", 3);
        }
        match f() {
            Err(SpareError::Precondition(msg)) => {
                assert_eq!(msg, "slot 3 busy");
            }
            x => panic!("wrong result {:?}", x),
        }
    }
}
