//! References: which devices a call is addressed to, and how lazily named
//! groups of devices get resolved.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lumen_core::{parse_serials, Target};

use crate::error::DispatchError;
use crate::found::Found;
use crate::options::{Broadcast, FindOptions};
use crate::sender::Sender;

/// Registry plus the serials resolved from it.
pub type Resolved = (Found, Vec<Target>);

type SharedFind = Shared<BoxFuture<'static, Result<Resolved, DispatchError>>>;

/// Memo cell for one resolution. The first `find` starts the work on its own
/// task; later calls (and concurrent ones) share its outcome until `reset`.
#[derive(Default)]
pub struct Resolution {
    pending: Mutex<Option<SharedFind>>,
}

impl Resolution {
    fn lock(&self) -> MutexGuard<'_, Option<SharedFind>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_or_start(
        &self,
        start: impl FnOnce() -> BoxFuture<'static, Result<Resolved, DispatchError>>,
    ) -> BoxFuture<'static, Result<Resolved, DispatchError>> {
        let mut slot = self.lock();
        if let Some(pending) = slot.as_ref() {
            return pending.clone().boxed();
        }
        let task = tokio::spawn(start());
        let shared = async move {
            match task.await {
                Ok(resolved) => resolved,
                Err(e) if e.is_cancelled() => Err(DispatchError::Cancelled),
                Err(e) => Err(DispatchError::Panicked(e.to_string())),
            }
        }
        .boxed()
        .shared();
        *slot = Some(shared.clone());
        shared.boxed()
    }

    pub fn is_started(&self) -> bool {
        self.lock().is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().as_ref().map_or(false, |s| s.peek().is_some())
    }

    /// Forget the memoized outcome. Callers already waiting still get it.
    pub fn reset(&self) {
        *self.lock() = None;
    }
}

/// A lazily resolved group of devices.
pub trait SpecialReference: Send + Sync + 'static {
    /// The actual resolution; run at most once per reset.
    fn find_serials(
        &self,
        sender: Sender,
        timeout: Duration,
        broadcast: Broadcast,
    ) -> BoxFuture<'static, Result<Resolved, DispatchError>>;

    fn resolution(&self) -> &Resolution;

    /// Devices that should have been found but were not.
    fn missing(&self, _found: &Found) -> Vec<Target> {
        Vec::new()
    }

    fn find(
        &self,
        sender: &Sender,
        timeout: Duration,
        broadcast: Broadcast,
    ) -> BoxFuture<'static, Result<Resolved, DispatchError>> {
        self.resolution()
            .get_or_start(|| self.find_serials(sender.clone(), timeout, broadcast))
    }

    fn reset(&self) {
        self.resolution().reset()
    }

    fn raise_on_missing(&self, found: &Found) -> Result<(), DispatchError> {
        let missing = self.missing(found);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::DevicesNotFound {
                missing: missing.iter().map(Target::serial).collect(),
            })
        }
    }
}

/// Every device that answers discovery.
#[derive(Default)]
pub struct FoundSerials {
    resolution: Resolution,
}

impl FoundSerials {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpecialReference for FoundSerials {
    fn find_serials(
        &self,
        sender: Sender,
        timeout: Duration,
        broadcast: Broadcast,
    ) -> BoxFuture<'static, Result<Resolved, DispatchError>> {
        async move {
            let opts = FindOptions::new(timeout)
                .broadcast(broadcast)
                .raise_on_none(true);
            let found = sender.find_devices(opts).await?;
            let serials = found.targets();
            Ok((found, serials))
        }
        .boxed()
    }

    fn resolution(&self) -> &Resolution {
        &self.resolution
    }
}

/// A fixed list of devices; only searches when some are not yet known.
pub struct HardCodedSerials {
    targets: Vec<Target>,
    resolution: Resolution,
}

impl HardCodedSerials {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets,
            resolution: Resolution::default(),
        }
    }

    /// Comma separated hex serials.
    pub fn parse(serials: &str) -> Result<Self, DispatchError> {
        Ok(Self::new(parse_serials(serials)?))
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }
}

impl SpecialReference for HardCodedSerials {
    fn find_serials(
        &self,
        sender: Sender,
        timeout: Duration,
        broadcast: Broadcast,
    ) -> BoxFuture<'static, Result<Resolved, DispatchError>> {
        let targets = self.targets.clone();
        async move {
            let mut found = sender.found().clone();
            if !targets.iter().all(|t| found.contains(t)) {
                let opts = FindOptions::new(timeout).broadcast(broadcast);
                found = sender.find_specific_serials(&targets, opts).await?.0;
            }
            let found = found.restricted(&targets);
            let serials = targets.into_iter().filter(|t| found.contains(t)).collect();
            Ok((found, serials))
        }
        .boxed()
    }

    fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    fn missing(&self, found: &Found) -> Vec<Target> {
        self.targets
            .iter()
            .filter(|t| !found.contains(t))
            .copied()
            .collect()
    }
}

/// Serials listed one per line in a file, read once up front.
pub struct SerialsFromFile {
    path: PathBuf,
    serials: HardCodedSerials,
}

impl SerialsFromFile {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DispatchError> {
        let path = path.as_ref().to_path_buf();
        let invalid = |reason: String| DispatchError::InvalidSerialsFile {
            path: path.clone(),
            reason,
        };
        let contents = std::fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        let targets = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Target::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(e.to_string()))?;
        if targets.is_empty() {
            return Err(invalid("found no serials".to_string()));
        }
        Ok(Self {
            serials: HardCodedSerials::new(targets),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn targets(&self) -> &[Target] {
        self.serials.targets()
    }
}

impl SpecialReference for SerialsFromFile {
    fn find_serials(
        &self,
        sender: Sender,
        timeout: Duration,
        broadcast: Broadcast,
    ) -> BoxFuture<'static, Result<Resolved, DispatchError>> {
        self.serials.find_serials(sender, timeout, broadcast)
    }

    fn resolution(&self) -> &Resolution {
        self.serials.resolution()
    }

    fn missing(&self, found: &Found) -> Vec<Target> {
        self.serials.missing(found)
    }
}

/// What a call is addressed to.
#[derive(Clone)]
pub enum Reference {
    /// Exactly these devices; searched for only if not already known.
    Serials(Vec<Target>),
    Special(Arc<dyn SpecialReference>),
}

impl Reference {
    /// Every device on the network.
    pub fn all() -> Self {
        Reference::Special(Arc::new(FoundSerials::new()))
    }

    /// `""` and `"_"` mean every device; otherwise a comma separated list.
    pub fn parse(s: &str) -> Result<Self, DispatchError> {
        match s.trim() {
            "" | "_" => Ok(Reference::all()),
            list => Ok(Reference::Serials(parse_serials(list)?)),
        }
    }

    pub fn special(reference: impl SpecialReference) -> Self {
        Reference::Special(Arc::new(reference))
    }

    /// Forget any memoized resolution.
    pub fn reset(&self) {
        if let Reference::Special(r) = self {
            r.reset();
        }
    }

    /// Resolve to the registry to use, the serials to address and, for
    /// special references, the serials that were not found. Missing serials
    /// are kept in the list so sending to them reports an error.
    pub async fn resolve(
        &self,
        sender: &Sender,
        found: Option<Found>,
        timeout: Duration,
        broadcast: Broadcast,
    ) -> Result<(Found, Vec<Target>, Option<Vec<Target>>), DispatchError> {
        match self {
            Reference::Serials(serials) => Ok((
                found.unwrap_or_else(|| sender.found().clone()),
                serials.clone(),
                None,
            )),
            Reference::Special(reference) => {
                let (found, mut serials) = reference.find(sender, timeout, broadcast).await?;
                let missing = reference.missing(&found);
                serials.extend(missing.iter().copied());
                Ok((found, serials, Some(missing)))
            }
        }
    }
}

impl From<Target> for Reference {
    fn from(target: Target) -> Self {
        Reference::Serials(vec![target])
    }
}

impl From<Vec<Target>> for Reference {
    fn from(targets: Vec<Target>) -> Self {
        Reference::Serials(targets)
    }
}

impl From<&[Target]> for Reference {
    fn from(targets: &[Target]) -> Self {
        Reference::Serials(targets.to_vec())
    }
}

impl From<Arc<dyn SpecialReference>> for Reference {
    fn from(reference: Arc<dyn SpecialReference>) -> Self {
        Reference::Special(reference)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Serials(targets) => f.debug_tuple("Serials").field(targets).finish(),
            Reference::Special(_) => write!(f, "Special"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parse_reference() {
        assert!(matches!(Reference::parse("").unwrap(), Reference::Special(_)));
        assert!(matches!(Reference::parse("_").unwrap(), Reference::Special(_)));
        match Reference::parse("d073d5000001,d073d5000002").unwrap() {
            Reference::Serials(list) => assert_eq!(list.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(Reference::parse("zz").is_err());
        assert!(Reference::parse("d073d5000001,d073d5+00001").is_err());
    }

    #[test]
    fn file_reference() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "d073d5000001\n\n  d073d5000002  ").unwrap();
        let r = SerialsFromFile::new(file.path()).unwrap();
        assert_eq!(r.targets().len(), 2);

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            SerialsFromFile::new(empty.path()),
            Err(DispatchError::InvalidSerialsFile { .. })
        ));
        assert!(matches!(
            SerialsFromFile::new("/nonexistent/serials.txt"),
            Err(DispatchError::InvalidSerialsFile { .. })
        ));
    }

    #[test]
    fn hardcoded_missing() {
        let r = HardCodedSerials::parse("d073d5000001,d073d5000004").unwrap();
        let missing = r.missing(&Found::new());
        assert_eq!(missing.len(), 2);
        assert!(matches!(
            r.raise_on_missing(&Found::new()),
            Err(DispatchError::DevicesNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resolution_runs_once_until_reset() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolution = Resolution::default();
        let start = || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok((Found::new(), Vec::new()))
            }
            .boxed()
        };

        let a = resolution.get_or_start(start);
        let b = resolution.get_or_start(start);
        assert!(resolution.is_started());
        a.await.unwrap();
        b.await.unwrap();
        assert!(resolution.is_resolved());
        resolution.get_or_start(start).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        resolution.reset();
        assert!(!resolution.is_started());
        resolution.get_or_start(start).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolution_shares_failure() {
        let resolution = Resolution::default();
        let failing = || async { Err(DispatchError::FoundNoDevices) }.boxed();
        assert!(matches!(
            resolution.get_or_start(failing).await,
            Err(DispatchError::FoundNoDevices)
        ));
        assert!(matches!(
            resolution.get_or_start(failing).await,
            Err(DispatchError::FoundNoDevices)
        ));
    }
}
