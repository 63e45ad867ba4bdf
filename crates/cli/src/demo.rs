use std::time::Duration;

use jobq_engine::{Executor, JobContext, JobError};

/// How long `Slow…` queries pretend to compute. Long enough to observe
/// (and interrupt) a running job from the outside.
const SLOW_QUERY_DELAY: Duration = Duration::from_secs(2);

/// Demo executor with runtime-discovered dependencies.
///
/// A query carrying a positive trailing integer `N` depends on the
/// same-stem query numbered `N-1`: evaluating `Job3` first awaits `Job2`,
/// which awaits `Job1`, and so on down to `Job0`. Results nest
/// accordingly (`Result-Job1(Result-Job0(~))`), with `~` marking a query
/// that needed no dependency. Queries with a `Slow` stem sleep before
/// resolving, giving crash-recovery demos a window to act in.
#[derive(Debug, Default)]
pub struct ChainExecutor;

fn split_trailing_number(query: &str) -> Option<(&str, u32)> {
    let digits_at = query.rfind(|c: char| !c.is_ascii_digit())? + 1;
    let (stem, digits) = query.split_at(digits_at);
    digits.parse().ok().map(|n| (stem, n))
}

impl Executor for ChainExecutor {
    fn execute(&self, ctx: &JobContext, query: &str) -> Result<String, JobError> {
        if query.starts_with("Slow") {
            std::thread::sleep(SLOW_QUERY_DELAY);
        }

        match split_trailing_number(query) {
            Some((stem, n)) if n > 0 => {
                let dep = ctx.wait_for(&format!("{stem}{}", n - 1))?;
                Ok(format!("Result-{query}({})", dep.result.unwrap_or_default()))
            }
            _ => Ok(format!("Result-{query}(~)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_numbers_define_dependencies() {
        assert_eq!(split_trailing_number("Job3"), Some(("Job", 3)));
        assert_eq!(split_trailing_number("Job0"), Some(("Job", 0)));
        assert_eq!(split_trailing_number("Slow12"), Some(("Slow", 12)));
        assert_eq!(split_trailing_number("Plain"), None);
        assert_eq!(split_trailing_number("Other1x"), None);
    }
}
