//! The blob-info cache: a process-wide map from a blob's digest to where it
//! has been seen before, plus the compressed/uncompressed digest
//! equivalence table that lets the copy pipeline skip re-compressing a
//! layer it has already pushed in the other form.
//!
//! The in-memory half is a plain `RwLock`-guarded map, the same choice the
//! registry client makes for its auth and ratelimit state rather than
//! reaching for a lock-free structure up front. The on-disk half persists
//! the same data under the three-table schema so a `containers-storage:`-like
//! long-lived process can warm-start.

use crate::digest::Digest;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    /// Identifies the transport and destination scope the blob was seen at,
    /// e.g. `docker://registry.example.com/ns/repo`.
    pub transport_scope: String,
    /// Opaque to the cache; transports interpret it (a blob digest string
    /// for docker, a path for archive transports).
    pub opaque_reference: String,
}

#[derive(Debug, Clone, Default)]
struct Record {
    locations: BTreeMap<Location, u64>,
}

/// Bound on same-scope candidates [`Cache::candidate_locations`] returns: a
/// location at the scope the caller is copying into or out of is one we
/// already "know" is reachable.
const MAX_SAME_SCOPE_CANDIDATES: usize = 5;
/// Bound on other-scope candidates; these are only useful for cross-repo
/// mount and are worth trying but not worth exhausting.
const MAX_OTHER_SCOPE_CANDIDATES: usize = 2;

pub struct Cache {
    by_digest: RwLock<HashMap<Digest, Record>>,
    uncompressed_of: RwLock<HashMap<Digest, Digest>>,
    compressed_of: RwLock<HashMap<Digest, Vec<Digest>>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Cache {
    pub fn new() -> Self {
        Cache {
            by_digest: RwLock::new(HashMap::new()),
            uncompressed_of: RwLock::new(HashMap::new()),
            compressed_of: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_known_location(&self, digest: &Digest, location: Location) {
        let mut map = self.by_digest.write().expect("blob-info cache lock poisoned");
        let record = map.entry(digest.clone()).or_default();
        record.locations.insert(location, now_secs());
    }

    pub fn record_digest_uncompressed_pair(&self, compressed: &Digest, uncompressed: &Digest) {
        {
            let mut map = self.uncompressed_of.write().expect("blob-info cache lock poisoned");
            map.insert(compressed.clone(), uncompressed.clone());
        }
        let mut map = self.compressed_of.write().expect("blob-info cache lock poisoned");
        let entry = map.entry(uncompressed.clone()).or_default();
        if !entry.contains(compressed) {
            entry.push(compressed.clone());
        }
    }

    pub fn uncompressed_digest(&self, compressed: &Digest) -> Option<Digest> {
        self.uncompressed_of
            .read()
            .expect("blob-info cache lock poisoned")
            .get(compressed)
            .cloned()
    }

    pub fn compressed_digests(&self, uncompressed: &Digest) -> Vec<Digest> {
        self.compressed_of
            .read()
            .expect("blob-info cache lock poisoned")
            .get(uncompressed)
            .cloned()
            .unwrap_or_default()
    }

    /// Digests equivalent to `digest` through the compressed/uncompressed
    /// mapping: the uncompressed form if `digest` is a compressed layer,
    /// every known compressed sibling if `digest` is itself uncompressed,
    /// or both when `digest` sits in the middle of a longer equivalence
    /// chain. Never includes `digest` itself.
    fn equivalent_digests(&self, digest: &Digest) -> Vec<Digest> {
        let mut equivalents = Vec::new();
        if let Some(uncompressed) = self.uncompressed_digest(digest) {
            if &uncompressed != digest {
                equivalents.push(uncompressed.clone());
            }
            for sibling in self.compressed_digests(&uncompressed) {
                if &sibling != digest && !equivalents.contains(&sibling) {
                    equivalents.push(sibling);
                }
            }
        }
        for compressed in self.compressed_digests(digest) {
            if &compressed != digest && !equivalents.contains(&compressed) {
                equivalents.push(compressed);
            }
        }
        equivalents
    }

    /// Candidate locations for `digest`, usable as a reuse or cross-repo
    /// mount source when copying into `scope`. Priority order: exact digest
    /// in `scope`, then equivalents (via [`Self::equivalent_digests`]) in
    /// `scope`, then exact digest elsewhere, then equivalents elsewhere;
    /// each group ordered most-recently-seen first. Bounded to
    /// [`MAX_SAME_SCOPE_CANDIDATES`] same-scope entries plus
    /// [`MAX_OTHER_SCOPE_CANDIDATES`] other-scope entries, so a blob seen at
    /// thousands of mirrors over a long-lived process's life doesn't make
    /// every copy attempt every one of them.
    pub fn candidate_locations(&self, digest: &Digest, scope: &str) -> Vec<Location> {
        let equivalents = self.equivalent_digests(digest);

        let map = self.by_digest.read().expect("blob-info cache lock poisoned");
        let exact: Vec<(&Location, u64)> = map
            .get(digest)
            .map(|r| r.locations.iter().map(|(l, t)| (l, *t)).collect())
            .unwrap_or_default();
        let mut equiv: Vec<(&Location, u64)> = Vec::new();
        for eq in &equivalents {
            if let Some(record) = map.get(eq) {
                equiv.extend(record.locations.iter().map(|(l, t)| (l, *t)));
            }
        }

        let mut same_exact: Vec<_> = exact.iter().filter(|(l, _)| l.transport_scope == scope).copied().collect();
        let mut same_equiv: Vec<_> = equiv.iter().filter(|(l, _)| l.transport_scope == scope).copied().collect();
        let mut other_exact: Vec<_> = exact.iter().filter(|(l, _)| l.transport_scope != scope).copied().collect();
        let mut other_equiv: Vec<_> = equiv.iter().filter(|(l, _)| l.transport_scope != scope).copied().collect();
        for group in [&mut same_exact, &mut same_equiv, &mut other_exact, &mut other_equiv] {
            group.sort_by(|a, b| b.1.cmp(&a.1));
        }

        let mut same_scope: Vec<Location> =
            same_exact.into_iter().chain(same_equiv).map(|(l, _)| l.clone()).collect();
        same_scope.truncate(MAX_SAME_SCOPE_CANDIDATES);

        let mut other_scope: Vec<Location> =
            other_exact.into_iter().chain(other_equiv).map(|(l, _)| l.clone()).collect();
        other_scope.truncate(MAX_OTHER_SCOPE_CANDIDATES);

        same_scope.into_iter().chain(other_scope).collect()
    }

    /// Drop all locations under a transport scope, e.g. after the caller
    /// learns a mirror was decommissioned.
    pub fn prune(&self, transport_scope: &str) {
        let mut map = self.by_digest.write().expect("blob-info cache lock poisoned");
        for record in map.values_mut() {
            record
                .locations
                .retain(|loc, _| loc.transport_scope != transport_scope);
        }
        map.retain(|_, record| !record.locations.is_empty());
    }

    /// Serialize the current state into the three-table row form the
    /// sqlite persistence layer writes. Row order is not significant.
    pub fn snapshot(&self) -> CacheSnapshot {
        let by_digest = self.by_digest.read().expect("blob-info cache lock poisoned");
        let mut digest_locations = Vec::new();
        for (digest, record) in by_digest.iter() {
            for (location, seen_at) in &record.locations {
                digest_locations.push(DigestLocationRow {
                    digest: digest.clone(),
                    transport_scope: location.transport_scope.clone(),
                    opaque_reference: location.opaque_reference.clone(),
                    last_seen: *seen_at,
                });
            }
        }
        let uncompressed_of = self.uncompressed_of.read().expect("blob-info cache lock poisoned");
        let digest_uncompressed_pairs = uncompressed_of
            .iter()
            .map(|(c, u)| UncompressedPairRow {
                compressed_digest: c.clone(),
                uncompressed_digest: u.clone(),
            })
            .collect();
        let compressed_of = self.compressed_of.read().expect("blob-info cache lock poisoned");
        let known_compressed_digests = compressed_of
            .iter()
            .flat_map(|(u, cs)| {
                cs.iter().map(move |c| KnownCompressedDigestRow {
                    uncompressed_digest: u.clone(),
                    compressed_digest: c.clone(),
                })
            })
            .collect();
        CacheSnapshot {
            digest_locations,
            digest_uncompressed_pairs,
            known_compressed_digests,
        }
    }

    pub fn restore(&self, snapshot: CacheSnapshot) {
        for row in snapshot.digest_locations {
            let mut map = self.by_digest.write().expect("blob-info cache lock poisoned");
            let record = map.entry(row.digest).or_default();
            record.locations.insert(
                Location {
                    transport_scope: row.transport_scope,
                    opaque_reference: row.opaque_reference,
                },
                row.last_seen,
            );
        }
        for row in snapshot.digest_uncompressed_pairs {
            self.record_digest_uncompressed_pair(&row.compressed_digest, &row.uncompressed_digest);
        }
        for row in snapshot.known_compressed_digests {
            let mut map = self.compressed_of.write().expect("blob-info cache lock poisoned");
            let entry = map.entry(row.uncompressed_digest).or_default();
            if !entry.contains(&row.compressed_digest) {
                entry.push(row.compressed_digest);
            }
        }
    }
}

pub struct DigestLocationRow {
    pub digest: Digest,
    pub transport_scope: String,
    pub opaque_reference: String,
    pub last_seen: u64,
}

pub struct UncompressedPairRow {
    pub compressed_digest: Digest,
    pub uncompressed_digest: Digest,
}

pub struct KnownCompressedDigestRow {
    pub uncompressed_digest: Digest,
    pub compressed_digest: Digest,
}

#[derive(Default)]
pub struct CacheSnapshot {
    pub digest_locations: Vec<DigestLocationRow>,
    pub digest_uncompressed_pairs: Vec<UncompressedPairRow>,
    pub known_compressed_digests: Vec<KnownCompressedDigestRow>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Open (creating if absent) a sqlite database at `path` with the three
/// tables the persisted blob-info cache uses, per `DigestLocations`,
/// `DigestUncompressedPairs`, `KnownCompressedDigests`.
pub fn open_sqlite(path: &std::path::Path) -> Result<rusqlite::Connection, PersistError> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS DigestLocations (
            digest TEXT NOT NULL,
            transport_scope TEXT NOT NULL,
            opaque_reference TEXT NOT NULL,
            last_seen INTEGER NOT NULL,
            PRIMARY KEY (digest, transport_scope, opaque_reference)
        );
        CREATE TABLE IF NOT EXISTS DigestUncompressedPairs (
            compressed_digest TEXT NOT NULL PRIMARY KEY,
            uncompressed_digest TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS KnownCompressedDigests (
            uncompressed_digest TEXT NOT NULL,
            compressed_digest TEXT NOT NULL,
            PRIMARY KEY (uncompressed_digest, compressed_digest)
        );",
    )?;
    Ok(conn)
}

pub fn persist(conn: &rusqlite::Connection, snapshot: &CacheSnapshot) -> Result<(), PersistError> {
    conn.execute("DELETE FROM DigestLocations", [])?;
    conn.execute("DELETE FROM DigestUncompressedPairs", [])?;
    conn.execute("DELETE FROM KnownCompressedDigests", [])?;
    for row in &snapshot.digest_locations {
        conn.execute(
            "INSERT INTO DigestLocations (digest, transport_scope, opaque_reference, last_seen) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![row.digest.to_string(), row.transport_scope, row.opaque_reference, row.last_seen as i64],
        )?;
    }
    for row in &snapshot.digest_uncompressed_pairs {
        conn.execute(
            "INSERT INTO DigestUncompressedPairs (compressed_digest, uncompressed_digest) VALUES (?1, ?2)",
            rusqlite::params![row.compressed_digest.to_string(), row.uncompressed_digest.to_string()],
        )?;
    }
    for row in &snapshot.known_compressed_digests {
        conn.execute(
            "INSERT INTO KnownCompressedDigests (uncompressed_digest, compressed_digest) VALUES (?1, ?2)",
            rusqlite::params![row.uncompressed_digest.to_string(), row.compressed_digest.to_string()],
        )?;
    }
    Ok(())
}

pub fn load(conn: &rusqlite::Connection) -> Result<CacheSnapshot, PersistError> {
    let mut snapshot = CacheSnapshot::default();
    let mut stmt = conn.prepare("SELECT digest, transport_scope, opaque_reference, last_seen FROM DigestLocations")?;
    let rows = stmt.query_map([], |row| {
        let digest: String = row.get(0)?;
        Ok((digest, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, i64>(3)?))
    })?;
    for row in rows {
        let (digest, transport_scope, opaque_reference, last_seen) = row?;
        let Ok(digest) = digest.parse() else { continue };
        snapshot.digest_locations.push(DigestLocationRow {
            digest,
            transport_scope,
            opaque_reference,
            last_seen: last_seen as u64,
        });
    }
    let mut stmt = conn.prepare("SELECT compressed_digest, uncompressed_digest FROM DigestUncompressedPairs")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (compressed, uncompressed) = row?;
        let (Ok(compressed_digest), Ok(uncompressed_digest)) = (compressed.parse(), uncompressed.parse()) else {
            continue;
        };
        snapshot
            .digest_uncompressed_pairs
            .push(UncompressedPairRow { compressed_digest, uncompressed_digest });
    }
    let mut stmt = conn.prepare("SELECT uncompressed_digest, compressed_digest FROM KnownCompressedDigests")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (uncompressed, compressed) = row?;
        let (Ok(uncompressed_digest), Ok(compressed_digest)) = (uncompressed.parse(), compressed.parse()) else {
            continue;
        };
        snapshot
            .known_compressed_digests
            .push(KnownCompressedDigestRow { uncompressed_digest, compressed_digest });
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Algorithm;

    fn digest(b: u8) -> Digest {
        Digest::new(Algorithm::Sha256, format!("{b:02x}").repeat(32)).unwrap()
    }

    #[test]
    fn candidate_locations_orders_newest_first_and_bounds_same_scope_count() {
        let cache = Cache::new();
        let d = digest(1);
        let scope = "docker://example.com/ns/repo";
        for i in 0..(MAX_SAME_SCOPE_CANDIDATES + 5) {
            cache.record_known_location(
                &d,
                Location { transport_scope: scope.to_string(), opaque_reference: format!("sha256:{i}") },
            );
        }
        assert_eq!(cache.candidate_locations(&d, scope).len(), MAX_SAME_SCOPE_CANDIDATES);
    }

    #[test]
    fn candidate_locations_prioritizes_same_scope_over_other_scope() {
        let cache = Cache::new();
        let d = digest(8);
        cache.record_known_location(&d, Location { transport_scope: "other".to_string(), opaque_reference: "x".to_string() });
        cache.record_known_location(&d, Location { transport_scope: "mine".to_string(), opaque_reference: "y".to_string() });
        let candidates = cache.candidate_locations(&d, "mine");
        assert_eq!(candidates[0].transport_scope, "mine");
        assert_eq!(candidates[1].transport_scope, "other");
    }

    #[test]
    fn candidate_locations_bounds_other_scope_count() {
        let cache = Cache::new();
        let d = digest(12);
        for i in 0..(MAX_OTHER_SCOPE_CANDIDATES + 3) {
            cache.record_known_location(
                &d,
                Location { transport_scope: format!("scope-{i}"), opaque_reference: "x".to_string() },
            );
        }
        assert_eq!(cache.candidate_locations(&d, "mine").len(), MAX_OTHER_SCOPE_CANDIDATES);
    }

    #[test]
    fn candidate_locations_includes_equivalent_digests() {
        let cache = Cache::new();
        let compressed = digest(10);
        let uncompressed = digest(11);
        cache.record_digest_uncompressed_pair(&compressed, &uncompressed);
        cache.record_known_location(&uncompressed, Location { transport_scope: "mine".to_string(), opaque_reference: "u".to_string() });
        let candidates = cache.candidate_locations(&compressed, "mine");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].opaque_reference, "u");
    }

    #[test]
    fn uncompressed_pair_is_bidirectional() {
        let cache = Cache::new();
        let c = digest(2);
        let u = digest(3);
        cache.record_digest_uncompressed_pair(&c, &u);
        assert_eq!(cache.uncompressed_digest(&c), Some(u.clone()));
        assert_eq!(cache.compressed_digests(&u), vec![c]);
    }

    #[test]
    fn prune_removes_only_matching_scope() {
        let cache = Cache::new();
        let d = digest(4);
        cache.record_known_location(&d, Location { transport_scope: "a".to_string(), opaque_reference: "x".to_string() });
        cache.record_known_location(&d, Location { transport_scope: "b".to_string(), opaque_reference: "y".to_string() });
        cache.prune("a");
        let remaining = cache.candidate_locations(&d, "b");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].transport_scope, "b");
    }

    #[test]
    fn unknown_digest_has_no_candidates() {
        let cache = Cache::new();
        assert!(cache.candidate_locations(&digest(9), "mine").is_empty());
    }

    #[test]
    fn snapshot_round_trips_through_sqlite() {
        let cache = Cache::new();
        let d = digest(5);
        cache.record_known_location(&d, Location { transport_scope: "a".to_string(), opaque_reference: "x".to_string() });
        cache.record_digest_uncompressed_pair(&digest(6), &digest(7));

        let file = tempfile::NamedTempFile::new().unwrap();
        let conn = open_sqlite(file.path()).unwrap();
        persist(&conn, &cache.snapshot()).unwrap();

        let loaded = load(&conn).unwrap();
        let restored = Cache::new();
        restored.restore(loaded);
        assert_eq!(restored.candidate_locations(&d, "a").len(), 1);
        assert_eq!(restored.uncompressed_digest(&digest(6)), Some(digest(7)));
    }
}
