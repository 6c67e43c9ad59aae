//! The accepted fetcher set: discovery against a latency budget, the
//! persisted cache, and random selection.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fetch_model::Fetcher;
use futures::stream::{self, StreamExt};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::compose;
use crate::error::Error;
use crate::probe::{ProbeOutcome, Prober, Rejection};

/// Bumped whenever the cached `Fetcher` layout changes.
const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Longest probe time for which a fetcher is kept.
    pub latency_budget: Duration,
    /// Probes in flight at once.
    pub workers: usize,
}

/// Probe result of one fetcher, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingEntry {
    /// Label of the probed fetcher.
    pub fetcher: String,
    /// Composed command; empty when the fetcher was rejected outright.
    pub command: String,
    /// `None` marks a failed probe.
    pub elapsed: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct FetcherSet {
    accepted: Vec<Fetcher>,
    timing: Vec<TimingEntry>,
    latency_budget: Duration,
    /// Names of fetchers that did not make it, for the empty-set message.
    dropped: Vec<String>,
}

#[derive(Deserialize)]
struct CacheRecord {
    version: u32,
    accepted: Vec<Fetcher>,
}

#[derive(Serialize)]
struct CacheRecordRef<'a> {
    version: u32,
    accepted: &'a [Fetcher],
}

struct Probed {
    accepted: bool,
    timing: TimingEntry,
}

impl FetcherSet {
    pub fn from_accepted(accepted: Vec<Fetcher>, latency_budget: Duration) -> Self {
        Self {
            accepted,
            latency_budget,
            ..Self::default()
        }
    }

    pub fn accepted(&self) -> &[Fetcher] {
        &self.accepted
    }

    /// Empty unless this set came from a discovery pass.
    pub fn timing(&self) -> &[TimingEntry] {
        &self.timing
    }

    pub fn latency_budget(&self) -> Duration {
        self.latency_budget
    }

    /// Probe every fetcher and keep those that answer within the budget.
    ///
    /// At most `options.workers` probes run at once. A fetcher that is found
    /// but slower than the budget is probed a second time (the first run may
    /// pay a cold start) and kept if that run fits. `accepted` and `timing`
    /// follow the order of `fetchers`.
    pub async fn discover<P: Prober>(
        fetchers: Vec<Fetcher>,
        options: &DiscoveryOptions,
        prober: &P,
    ) -> Self {
        let budget = options.latency_budget;
        info!(
            candidates = fetchers.len(),
            ?budget,
            workers = options.workers,
            "probing fetchers"
        );

        let results: Vec<Probed> = stream::iter(fetchers.iter())
            .map(|fetcher| probe_candidate(prober, fetcher, budget))
            .buffered(options.workers.max(1))
            .collect()
            .await;

        let mut set = Self::from_accepted(Vec::new(), budget);
        for (fetcher, probed) in fetchers.into_iter().zip(results) {
            set.timing.push(probed.timing);
            if probed.accepted {
                set.accepted.push(fetcher);
            } else if !set.dropped.contains(&fetcher.name) {
                set.dropped.push(fetcher.name);
            }
        }
        info!(
            accepted = set.accepted.len(),
            probed = set.timing.len(),
            "discovery finished"
        );
        set
    }

    /// Read a cache written by [`FetcherSet::persist`]. No timing survives.
    ///
    /// # Errors
    /// [`Error::Io`] when the file cannot be read (including when it does
    /// not exist), [`Error::CacheCorrupt`] when it cannot be decoded.
    pub fn load(path: &Path, latency_budget: Duration) -> Result<Self, Error> {
        let data = fs::read(path)?;
        let record: CacheRecord =
            serde_json::from_slice(&data).map_err(|err| Error::cache_corrupt(path, err))?;
        if record.version != CACHE_VERSION {
            return Err(Error::cache_corrupt(
                path,
                format!(
                    "cache version {} does not match {CACHE_VERSION}",
                    record.version
                ),
            ));
        }
        Ok(Self::from_accepted(record.accepted, latency_budget))
    }

    /// Write the accepted fetchers to `path`, replacing it atomically.
    pub fn persist(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = CacheRecordRef {
            version: CACHE_VERSION,
            accepted: &self.accepted,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(io::Error::other)?;

        let tmp = temp_sibling(path);
        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        if let Err(err) = written.and_then(|()| fs::rename(&tmp, path)) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        debug!(path = %path.display(), fetchers = self.accepted.len(), "saved fetcher cache");
        Ok(())
    }

    /// Use the cache at `cache` unless `reset` is set or it is missing or
    /// unreadable; otherwise discover from `candidates()` and save the result.
    ///
    /// An empty result is not saved and any previous cache is removed, so the
    /// next run probes again instead of serving fetchers that just failed.
    pub async fn open_or_discover<P, F>(
        cache: &Path,
        reset: bool,
        options: &DiscoveryOptions,
        prober: &P,
        candidates: F,
    ) -> Result<Self, Error>
    where
        P: Prober,
        F: FnOnce() -> Result<Vec<Fetcher>, Error>,
    {
        if reset {
            info!("rescan requested; ignoring fetcher cache");
        } else {
            match Self::load(cache, options.latency_budget) {
                Ok(set) => {
                    debug!(path = %cache.display(), fetchers = set.accepted.len(), "loaded fetcher cache");
                    return Ok(set);
                }
                Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                    info!(path = %cache.display(), "no fetcher cache yet; running discovery");
                }
                Err(err) => {
                    warn!(error = %err, "discarding fetcher cache; running discovery");
                }
            }
        }

        let set = Self::discover(candidates()?, options, prober).await;
        if set.accepted.is_empty() {
            warn!("no fetcher passed probing; fetcher cache cleared");
            remove_cache(cache)?;
        } else {
            set.persist(cache)?;
        }
        Ok(set)
    }

    /// Uniformly random accepted fetcher.
    pub fn pick(&self) -> Result<&Fetcher, Error> {
        self.pick_with(&mut rand::rng())
    }

    pub fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<&Fetcher, Error> {
        self.accepted
            .choose(rng)
            .ok_or_else(|| Error::EmptyAcceptedSet {
                hint: self.empty_hint(),
            })
    }

    fn empty_hint(&self) -> String {
        if self.dropped.is_empty() {
            "the fetcher cache is empty; install a fetcher such as neofetch or fastfetch, \
             add images with `randofetch add-images`, then rerun with --scan"
                .to_string()
        } else {
            format!(
                "none of the configured programs passed probing (tried: {}); install one of \
                 them or raise the latency budget with --timeout",
                self.dropped.join(", ")
            )
        }
    }
}

async fn probe_candidate<P: Prober>(prober: &P, fetcher: &Fetcher, budget: Duration) -> Probed {
    let label = fetcher.label();
    let first = match prober.probe(fetcher).await {
        ProbeOutcome::Accepted { elapsed } => elapsed,
        ProbeOutcome::Rejected(rejection) => {
            log_rejection(&label, &rejection);
            return Probed {
                accepted: false,
                timing: TimingEntry {
                    fetcher: label,
                    command: String::new(),
                    elapsed: None,
                },
            };
        }
    };

    let command = compose(fetcher);
    if first <= budget {
        debug!(fetcher = %label, elapsed = ?first, "fetcher accepted");
        return Probed {
            accepted: true,
            timing: TimingEntry {
                fetcher: label,
                command,
                elapsed: Some(first),
            },
        };
    }

    debug!(fetcher = %label, elapsed = ?first, ?budget, "over budget; probing again");
    let (accepted, elapsed) = match prober.probe(fetcher).await {
        ProbeOutcome::Accepted { elapsed } => (elapsed <= budget, Some(elapsed)),
        ProbeOutcome::Rejected(rejection) => {
            log_rejection(&label, &rejection);
            (false, None)
        }
    };
    if accepted {
        debug!(fetcher = %label, ?elapsed, "fetcher accepted on retry");
    } else if let Some(elapsed) = elapsed {
        info!(fetcher = %label, ?elapsed, ?budget, check = "latency", "fetcher too slow; dropped");
    }
    Probed {
        accepted,
        timing: TimingEntry {
            fetcher: label,
            command,
            elapsed,
        },
    }
}

fn remove_cache(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn log_rejection(label: &str, rejection: &Rejection) {
    if let Rejection::TimedOut(timeout) = rejection {
        let err = Error::ProbeTimeout {
            fetcher: label.to_string(),
            timeout: *timeout,
        };
        warn!(fetcher = %label, check = rejection.check(), error = %err, "probe abandoned");
    } else {
        info!(fetcher = %label, check = rejection.check(), reason = %rejection, "fetcher rejected");
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", std::process::id()))
}

/// Plain-text table of a discovery pass.
pub fn render_timing(entries: &[TimingEntry]) -> String {
    let width = entries
        .iter()
        .map(|entry| entry.fetcher.chars().count())
        .max()
        .unwrap_or(0)
        .max("fetcher".len());
    let mut out = String::new();
    let _ = writeln!(out, "{:<width$}  {:>9}  command", "fetcher", "time");
    let _ = writeln!(out, "{}", "-".repeat(width + 22));
    for entry in entries {
        let time = match entry.elapsed {
            Some(elapsed) => format!("{:.3}s", elapsed.as_secs_f64()),
            None => "failed".to_string(),
        };
        let _ = writeln!(out, "{:<width$}  {:>9}  {}", entry.fetcher, time, entry.command);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use fetch_model::{ArgTemplate, ProgramDescriptor};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    const BUDGET: Duration = Duration::from_millis(100);

    /// Replays scripted outcomes per fetcher name; unknown names are missing.
    #[derive(Default)]
    struct ScriptedProber {
        script: Mutex<HashMap<String, VecDeque<ProbeOutcome>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        fn with(mut self, name: &str, outcomes: Vec<ProbeOutcome>) -> Self {
            self.script
                .get_mut()
                .unwrap()
                .insert(name.to_string(), outcomes.into());
            self
        }

        fn calls_for(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|n| *n == name).count()
        }
    }

    impl Prober for ScriptedProber {
        async fn probe(&self, fetcher: &Fetcher) -> ProbeOutcome {
            self.calls.lock().unwrap().push(fetcher.name.clone());
            self.script
                .lock()
                .unwrap()
                .get_mut(&fetcher.name)
                .and_then(|outcomes| outcomes.pop_front())
                .unwrap_or(ProbeOutcome::Rejected(Rejection::NotFound { status: Some(127) }))
        }
    }

    fn ok(ms: u64) -> ProbeOutcome {
        ProbeOutcome::Accepted {
            elapsed: Duration::from_millis(ms),
        }
    }

    fn fetcher(name: &str) -> Fetcher {
        Fetcher::from_descriptor(&ProgramDescriptor {
            name: name.to_string(),
            path: name.to_string(),
            args: ArgTemplate::from("--x"),
            extra_requirement: None,
            needs_image: false,
        })
    }

    fn options(workers: usize) -> DiscoveryOptions {
        DiscoveryOptions {
            latency_budget: BUDGET,
            workers,
        }
    }

    fn names(set: &FetcherSet) -> Vec<&str> {
        set.accepted().iter().map(|f| f.name.as_str()).collect()
    }

    #[tokio::test]
    async fn elapsed_equal_to_budget_is_accepted_without_retry() {
        let prober = ScriptedProber::default().with("a", vec![ok(100)]);
        let set = FetcherSet::discover(vec![fetcher("a")], &options(1), &prober).await;
        assert_eq!(names(&set), vec!["a"]);
        assert_eq!(prober.calls_for("a"), 1);
        assert_eq!(
            set.timing(),
            &[TimingEntry {
                fetcher: "a".into(),
                command: "a --x".into(),
                elapsed: Some(BUDGET),
            }]
        );
    }

    #[tokio::test]
    async fn over_budget_is_retried_once_and_kept_at_budget() {
        let prober = ScriptedProber::default().with("slow", vec![ok(101), ok(100)]);
        let set = FetcherSet::discover(vec![fetcher("slow")], &options(1), &prober).await;
        assert_eq!(names(&set), vec!["slow"]);
        assert_eq!(prober.calls_for("slow"), 2);
        assert_eq!(set.timing().len(), 1);
        assert_eq!(set.timing()[0].elapsed, Some(BUDGET));
    }

    #[tokio::test]
    async fn over_budget_twice_is_dropped_with_retry_timing() {
        let prober = ScriptedProber::default().with("slow", vec![ok(500), ok(300), ok(1)]);
        let set = FetcherSet::discover(vec![fetcher("slow")], &options(1), &prober).await;
        assert!(set.accepted().is_empty());
        assert_eq!(prober.calls_for("slow"), 2);
        assert_eq!(set.timing()[0].command, "slow --x");
        assert_eq!(set.timing()[0].elapsed, Some(Duration::from_millis(300)));
    }

    #[tokio::test]
    async fn rejected_fetchers_get_failed_timing() {
        let prober = ScriptedProber::default().with("a", vec![ok(1)]);
        let set =
            FetcherSet::discover(vec![fetcher("a"), fetcher("gone")], &options(2), &prober).await;
        assert_eq!(names(&set), vec!["a"]);
        assert_eq!(
            set.timing()[1],
            TimingEntry {
                fetcher: "gone".into(),
                command: String::new(),
                elapsed: None,
            }
        );
    }

    #[tokio::test]
    async fn concurrent_probing_keeps_expansion_order() {
        let mut prober = ScriptedProber::default();
        let all: Vec<_> = (0..12).map(|i| format!("f{i}")).collect();
        for name in &all {
            prober = prober.with(name, vec![ok(5)]);
        }
        let fetchers = all.iter().map(|n| fetcher(n)).collect();
        let set = FetcherSet::discover(fetchers, &options(4), &prober).await;
        assert_eq!(names(&set), all.iter().map(String::as_str).collect::<Vec<_>>());
        let timed: Vec<_> = set.timing().iter().map(|t| t.fetcher.as_str()).collect();
        assert_eq!(timed, names(&set));
    }

    #[tokio::test]
    async fn discovery_is_idempotent_for_a_stable_host() {
        let script = || {
            ScriptedProber::default()
                .with("a", vec![ok(1)])
                .with("b", vec![ok(300), ok(2)])
        };
        let candidates = || vec![fetcher("a"), fetcher("b"), fetcher("c")];
        let first = FetcherSet::discover(candidates(), &options(3), &script()).await;
        let second = FetcherSet::discover(candidates(), &options(1), &script()).await;
        assert_eq!(first.accepted(), second.accepted());
        assert_eq!(names(&first), vec!["a", "b"]);
    }

    #[test]
    fn empty_set_pick_is_an_error_naming_what_was_tried() {
        let set = FetcherSet {
            dropped: vec!["neofetch".into(), "chafa".into()],
            ..FetcherSet::default()
        };
        let err = set.pick().expect_err("empty");
        assert!(matches!(err, Error::EmptyAcceptedSet { .. }));
        assert!(err.to_string().contains("neofetch, chafa"), "{err}");

        let err = FetcherSet::default().pick().expect_err("empty");
        assert!(err.to_string().contains("--scan"), "{err}");
    }

    #[test]
    fn pick_is_uniform_over_accepted() {
        let set = FetcherSet::from_accepted(vec![fetcher("a"), fetcher("b"), fetcher("c")], BUDGET);
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..3000 {
            let picked = set.pick_with(&mut rng).expect("pick");
            *counts.entry(picked.name.clone()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!((800..1200).contains(count), "skewed pick: {counts:?}");
        }
    }

    #[test]
    fn persist_then_load_round_trips_every_field() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("nested").join("fetchers.json");
        let mut image = fetcher("fastfetch");
        image.needs_image = true;
        image.image_args = "--logo '/x y.png'".into();
        image.extra_requirement =
            Some(fetch_model::ExtraRequirement::EnvCapability("KITTY_WINDOW_ID".into()));
        let set = FetcherSet::from_accepted(vec![fetcher("a"), image], BUDGET);

        set.persist(&path).expect("persist");
        let loaded = FetcherSet::load(&path, BUDGET).expect("load");
        assert_eq!(loaded.accepted(), set.accepted());
        assert!(loaded.timing().is_empty());

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec!["fetchers.json"]);
    }

    #[test]
    fn garbage_and_version_mismatch_are_cache_corrupt() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("fetchers.json");
        fs::write(&path, b"\x80not json").unwrap();
        assert!(matches!(
            FetcherSet::load(&path, BUDGET),
            Err(Error::CacheCorrupt { .. })
        ));
        fs::write(&path, br#"{"version": 99, "accepted": []}"#).unwrap();
        assert!(matches!(
            FetcherSet::load(&path, BUDGET),
            Err(Error::CacheCorrupt { .. })
        ));
    }

    #[tokio::test]
    async fn corrupt_cache_falls_back_to_discovery() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("fetchers.json");
        fs::write(&path, b"{ truncated").unwrap();
        let prober = ScriptedProber::default().with("a", vec![ok(1)]);

        let set = FetcherSet::open_or_discover(&path, false, &options(1), &prober, || {
            Ok(vec![fetcher("a")])
        })
        .await
        .expect("fallback discovery");
        assert_eq!(names(&set), vec!["a"]);
        assert_eq!(
            FetcherSet::load(&path, BUDGET).expect("rewritten").accepted(),
            set.accepted()
        );
    }

    #[tokio::test]
    async fn valid_cache_skips_probing_unless_reset() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("fetchers.json");
        FetcherSet::from_accepted(vec![fetcher("cached")], BUDGET)
            .persist(&path)
            .unwrap();

        let prober = ScriptedProber::default().with("fresh", vec![ok(1)]);
        let set = FetcherSet::open_or_discover(&path, false, &options(1), &prober, || {
            panic!("candidates must not be expanded when the cache is valid")
        })
        .await
        .expect("load");
        assert_eq!(names(&set), vec!["cached"]);
        assert!(prober.calls.lock().unwrap().is_empty());

        let set = FetcherSet::open_or_discover(&path, true, &options(1), &prober, || {
            Ok(vec![fetcher("fresh")])
        })
        .await
        .expect("reset");
        assert_eq!(names(&set), vec!["fresh"]);
        assert_eq!(set.timing().len(), 1);
    }

    #[tokio::test]
    async fn empty_discovery_is_not_cached() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("fetchers.json");
        let prober = ScriptedProber::default();
        let set = FetcherSet::open_or_discover(&path, false, &options(1), &prober, || {
            Ok(vec![fetcher("gone")])
        })
        .await
        .expect("discovery itself succeeds");
        assert!(set.pick().is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn empty_rescan_removes_the_previous_cache() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("fetchers.json");
        FetcherSet::from_accepted(vec![fetcher("uninstalled")], BUDGET)
            .persist(&path)
            .unwrap();

        let prober = ScriptedProber::default();
        let set = FetcherSet::open_or_discover(&path, true, &options(1), &prober, || {
            Ok(vec![fetcher("uninstalled")])
        })
        .await
        .expect("rescan");
        assert!(set.pick().is_err());
        assert!(!path.exists());

        let prober = ScriptedProber::default().with("uninstalled", vec![ok(1)]);
        let next = FetcherSet::open_or_discover(&path, false, &options(1), &prober, || {
            Ok(vec![fetcher("uninstalled")])
        })
        .await
        .expect("next run");
        assert_eq!(prober.calls_for("uninstalled"), 1, "next run must probe again");
        assert_eq!(names(&next), vec!["uninstalled"]);
    }

    #[tokio::test]
    async fn over_budget_then_missing_on_retry_is_dropped() {
        let prober = ScriptedProber::default().with(
            "flaky",
            vec![ok(400), ProbeOutcome::Rejected(Rejection::TimedOut(BUDGET))],
        );
        let set = FetcherSet::discover(vec![fetcher("flaky")], &options(1), &prober).await;
        assert!(set.accepted().is_empty());
        assert_eq!(prober.calls_for("flaky"), 2);
        assert_eq!(
            set.timing(),
            &[TimingEntry {
                fetcher: "flaky".into(),
                command: "flaky --x".into(),
                elapsed: None,
            }]
        );

        // the script for "gone" is exhausted after one run, so the retry is not found
        let prober = ScriptedProber::default().with("gone", vec![ok(250)]);
        let set = FetcherSet::discover(vec![fetcher("gone")], &options(1), &prober).await;
        assert!(set.accepted().is_empty());
        assert_eq!(set.timing()[0].elapsed, None);
        assert!(set.pick().expect_err("empty").to_string().contains("gone"));
    }

    #[test]
    fn timing_table_marks_failures() {
        let table = render_timing(&[
            TimingEntry {
                fetcher: "neofetch".into(),
                command: "neofetch".into(),
                elapsed: Some(Duration::from_millis(250)),
            },
            TimingEntry {
                fetcher: "chafa".into(),
                command: String::new(),
                elapsed: None,
            },
        ]);
        assert!(table.contains("0.250s"), "{table}");
        assert!(table.lines().any(|l| l.starts_with("chafa") && l.contains("failed")));
    }
}
