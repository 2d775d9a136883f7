//! The ordered, mutable list of candidate destination paths for one
//! transaction.

use tor_error::internal;

use crate::path::{PathProfile, PathKind};
use crate::{Error, Result};

/// One entry in a [`ResolvedPeers`] list.
#[derive(Debug, Clone)]
struct ResolvedPath {
    /// The candidate destination.
    profile: PathProfile,
    /// Whether this path may be used (i.e., has not been tried already).
    available: bool,
}

/// The result of scanning for a particular kind of path: the index of the
/// found path (if any), and whether an "other"-kind path was found instead.
#[derive(Debug, Clone, Copy)]
struct Finding {
    /// Index of a viable path of the requested kind.
    found: Option<usize>,
    /// Whether the scan stopped on a path of a different kind.
    found_other: bool,
}

/// Candidate destination addresses (a.k.a. paths) selected and resolved by
/// the peering code, in the order they should be tried.
///
/// Entries are appended only.  Extracting a path marks its slot unavailable
/// but keeps the slot, so that a failed attempt can
/// [`reinstate`](ResolvedPeers::reinstate) the path at its original
/// position.
#[derive(Debug, Default)]
pub struct ResolvedPeers {
    /// Resolved paths in (gateway, family) order of arrival.
    paths: Vec<ResolvedPath>,
    /// The length of the leading run of unavailable entries; equivalently,
    /// the position of the first available path (or `paths.len()`).
    paths_to_skip: usize,
    /// The total number of currently available entries.
    available_paths: usize,
    /// Whether peer selection has produced every path it ever will.
    finalized: bool,
}

/// A previously extracted path, remembering its slot so that it can be
/// returned to its [`ResolvedPeers`] list for a later retry.
#[derive(Debug, Clone)]
pub struct PathRef {
    /// The extracted destination profile.
    profile: PathProfile,
    /// The slot this path came from, if it came from a list at all.
    position: Option<usize>,
}

impl PathRef {
    /// Construct a path reference with no list membership.
    ///
    /// Used for paths that did not come from a [`ResolvedPeers`] list, such
    /// as pinned connections.
    pub fn unlisted(profile: PathProfile) -> Self {
        PathRef {
            profile,
            position: None,
        }
    }

    /// Return the destination profile.
    pub fn profile(&self) -> &PathProfile {
        &self.profile
    }

    /// Return a mutable reference to the destination profile.
    pub fn profile_mut(&mut self) -> &mut PathProfile {
        &mut self.profile
    }

    /// Return the slot index in the originating list, if any.
    pub fn position(&self) -> Option<usize> {
        self.position
    }
}

impl std::fmt::Display for PathRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.profile)?;
        if let Some(pos) = self.position {
            write!(f, " @{}", pos)?;
        }
        Ok(())
    }
}

impl ResolvedPeers {
    /// Return a new, empty list.
    pub fn new() -> Self {
        ResolvedPeers::default()
    }

    /// Return true if we lack any known candidate paths.
    pub fn is_empty(&self) -> bool {
        self.available_paths == 0
    }

    /// Return the current number of candidate paths.
    pub fn size(&self) -> usize {
        self.available_paths
    }

    /// Return true if peer selection has produced every path it will.
    pub fn finalized(&self) -> bool {
        self.finalized
    }

    /// Note that peer selection has produced every path it will.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Append a candidate path, to be tried after all the existing ones.
    pub fn add(&mut self, profile: PathProfile) {
        self.paths.push(ResolvedPath {
            profile,
            available: true,
        });
        // The new entry is available, so paths_to_skip needs no update.
        self.available_paths += 1;
    }

    /// Make a previously extracted path available again at its original
    /// position.
    pub fn reinstate(&mut self, path: &PathRef) -> Result<()> {
        let Some(pos) = path.position else {
            return Err(internal!("reinstating a path that was never extracted").into());
        };
        let entry = self
            .paths
            .get_mut(pos)
            .ok_or_else(|| Error::from(internal!("path position out of range")))?;
        if entry.available {
            return Err(internal!("reinstating a path that is already available").into());
        }
        entry.available = true;
        self.available_paths += 1;

        // If we restored availability of a path that we used to skip, update.
        if pos < self.paths_to_skip {
            self.paths_to_skip = pos;
        }
        Ok(())
    }

    /// Return the index where any available-path scan starts.
    fn start(&self) -> usize {
        self.paths_to_skip
    }

    /// Extract and return the first available path.
    ///
    /// It is a bug to call this on an empty list.
    pub fn extract_front(&mut self) -> Result<PathRef> {
        if self.is_empty() {
            return Err(internal!("extracting from an empty path list").into());
        }
        let start = self.start();
        Ok(self.extract_found("first", start))
    }

    /// Extract and return the first available same-gateway same-family path,
    /// or None if the scan proves there is none right now.
    pub fn extract_prime(&mut self, current: &PathProfile) -> Option<PathRef> {
        let found = self.find_prime(current).found?;
        Some(self.extract_found("same-gateway same-family match", found))
    }

    /// Extract and return the first available same-gateway different-family
    /// path, or None if the scan proves there is none right now.
    pub fn extract_spare(&mut self, current: &PathProfile) -> Option<PathRef> {
        let found = self.find_spare(current).found?;
        Some(self.extract_found("same-gateway different-family match", found))
    }

    /// Return whether [`extract_prime`](Self::extract_prime) would return a
    /// path right now.
    pub fn have_prime(&self, current: &PathProfile) -> bool {
        self.find_prime(current).found.is_some()
    }

    /// Return whether [`extract_spare`](Self::extract_spare) would return a
    /// path right now.
    pub fn have_spare(&self, current: &PathProfile) -> bool {
        self.find_spare(current).found.is_some()
    }

    /// Return whether [`extract_prime`](Self::extract_prime) returns and
    /// will continue to return None.
    pub fn done_with_primes(&self, current: &PathProfile) -> bool {
        self.done_with(self.find_prime(current))
    }

    /// Return whether [`extract_spare`](Self::extract_spare) returns and
    /// will continue to return None.
    pub fn done_with_spares(&self, current: &PathProfile) -> bool {
        self.done_with(self.find_spare(current))
    }

    /// Return whether both prime and spare extraction are permanently
    /// exhausted for `current`'s gateway.
    pub fn done_with_peer(&self, current: &PathProfile) -> bool {
        self.done_with(self.find_peer(current))
    }

    /// Shared "is this kind of path permanently exhausted" logic.
    ///
    /// If the scan found a viable path, we are not done.  If it stopped on
    /// an "other" path, no matching path can ever appear before it, so we
    /// are done.  Otherwise the answer depends on whether the list is
    /// final.
    fn done_with(&self, finding: Finding) -> bool {
        if finding.found.is_some() {
            return false;
        }
        finding.found_other || self.finalized
    }

    /// Find the first available same-gateway same-family path.
    ///
    /// Only the front available entry can be a prime: anything behind it is
    /// either a spare for this gateway or a path to the next one.
    fn find_prime(&self, current: &PathProfile) -> Finding {
        let start = self.start();
        match self.paths.get(start) {
            Some(entry) => {
                let other = !current.same_gateway(&entry.profile)
                    || current.family() != entry.profile.family();
                Finding {
                    found: (!other).then_some(start),
                    found_other: other,
                }
            }
            None => Finding {
                found: None,
                found_other: false,
            },
        }
    }

    /// Find the first available same-gateway different-family path, looking
    /// no further than the first path belonging to another gateway.
    fn find_spare(&self, current: &PathProfile) -> Finding {
        let family = current.family();
        for (idx, entry) in self.paths.iter().enumerate().skip(self.start()) {
            if !entry.available {
                continue;
            }
            if !current.same_gateway(&entry.profile) {
                return Finding {
                    found: None,
                    found_other: true,
                };
            }
            if entry.profile.family() != family {
                return Finding {
                    found: Some(idx),
                    found_other: false,
                };
            }
        }
        Finding {
            found: None,
            found_other: false,
        }
    }

    /// Find the first available path for `current`'s gateway.
    fn find_peer(&self, current: &PathProfile) -> Finding {
        let start = self.start();
        match self.paths.get(start) {
            Some(entry) => {
                let other = !current.same_gateway(&entry.profile);
                Finding {
                    found: (!other).then_some(start),
                    found_other: other,
                }
            }
            None => Finding {
                found: None,
                found_other: false,
            },
        }
    }

    /// Finish a successful scan: mark the slot unavailable and hand out a
    /// clean profile clone with the slot remembered.
    fn extract_found(&mut self, description: &str, found: usize) -> PathRef {
        let entry = &mut self.paths[found];
        debug_assert!(entry.available);
        entry.available = false;
        debug_assert!(self.available_paths > 0);
        self.available_paths -= 1;
        tracing::trace!("extracted {}: {}", description, entry.profile);

        let profile = entry.profile.clone_profile();

        // If we extracted the left-most available path, find the next one.
        if found == self.paths_to_skip {
            while self.paths_to_skip < self.paths.len()
                && !self.paths[self.paths_to_skip].available
            {
                self.paths_to_skip += 1;
            }
        }

        PathRef {
            profile,
            position: Some(found),
        }
    }

    /// Convert a standby profile extracted from a pool into a usable path.
    ///
    /// Standby connections are opened before selection runs; once selection
    /// assigns them to a transaction the standby tag no longer applies.
    pub fn retag_standby(profile: &mut PathProfile) {
        if profile.kind() == PathKind::Standby {
            profile.set_kind(PathKind::Gateway);
        }
    }
}

impl std::fmt::Display for ResolvedPeers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "[no paths]");
        }
        write!(
            f,
            "{}{} paths",
            self.size(),
            if self.finalized { "" } else { "+" }
        )
    }
}
