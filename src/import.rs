use std::slice;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::backend::MetadataStore;
use crate::error::Result;
use crate::model::{DataPoint, ImportSummary, MDType, Metadata, Tsuid, META_END_DATE, META_NB_POINTS, META_START_DATE};

/// Metadata a child never takes from its parent: quality indicators,
/// system-computed values and the functional identifier.
pub const NON_INHERITABLE: &str = r"^(?:qual.*|ikats.*|funcId)";

/// Post-write bookkeeping of an import: intrinsic metadata and inheritance.
#[derive(Clone)]
pub struct Importer {
    metadata: Arc<dyn MetadataStore>,
    non_inheritable: Regex,
}

impl Importer {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Result<Self> {
        Ok(Self { metadata, non_inheritable: Regex::new(NON_INHERITABLE)? })
    }

    pub fn is_inheritable(&self, name: &str) -> bool {
        !self.non_inheritable.is_match(name)
    }

    /// `written` is the count reported by the point store. Dates only widen:
    /// a chunk older than what is known never shrinks the end date.
    pub async fn finalize_import(
        &self,
        tsuid: &Tsuid,
        points: &[DataPoint],
        written: usize,
        parent: Option<&Tsuid>,
        generate_metadata: bool,
    ) -> Result<ImportSummary> {
        let mut summary = ImportSummary {
            tsuid: tsuid.clone(),
            submitted: points.len(),
            nb_points: written,
            start_date: None,
            end_date: None,
            inherited: 0,
        };

        if generate_metadata {
            let current = self.metadata_of(tsuid).await?;
            let known_start = known_date(&current, META_START_DATE, tsuid);
            let known_end = known_date(&current, META_END_DATE, tsuid);
            summary.start_date = known_start;
            summary.end_date = known_end;

            if let (Some(first), Some(last)) = (points.first(), points.last()) {
                let (start, end) = (first.timestamp, last.timestamp);
                if known_start.map_or(true, |known| known > start) {
                    self.metadata.upsert(tsuid, META_START_DATE, &start.to_string(), MDType::Date).await?;
                    summary.start_date = Some(start);
                }
                if known_end.map_or(true, |known| known < end) {
                    self.metadata.upsert(tsuid, META_END_DATE, &end.to_string(), MDType::Date).await?;
                    summary.end_date = Some(end);
                }
            }
            self.metadata.upsert(tsuid, META_NB_POINTS, &written.to_string(), MDType::Number).await?;
        }

        if let Some(parent) = parent {
            summary.inherited = self.inherit(tsuid, parent).await;
        }
        Ok(summary)
    }

    /// Copies the inheritable metadata of `parent` onto `child`. Never fails:
    /// problems are logged and the number of copied entries is returned.
    pub async fn inherit(&self, child: &Tsuid, parent: &Tsuid) -> usize {
        let parent_md = match self.metadata_of(parent).await {
            Ok(md) => md,
            Err(e) => {
                warn!("Can't get metadata of parent TS ({}), nothing will be inherited; reason: {}", parent, e);
                return 0;
            }
        };

        let mut copied = 0;
        for (name, entry) in parent_md.iter().filter(|(name, _)| self.is_inheritable(name)) {
            match self.metadata.upsert(child, name, &entry.value, entry.dtype).await {
                Ok(()) => copied += 1,
                Err(e) => warn!("Can't inherit metadata {} from {} to {}: {}", name, parent, child, e),
            }
        }
        debug!("{} inherited {} metadata from {}", child, copied, parent);
        copied
    }

    async fn metadata_of(&self, tsuid: &Tsuid) -> Result<Metadata> {
        let mut all = self.metadata.get_typed(slice::from_ref(tsuid)).await?;
        Ok(all.remove(tsuid).unwrap_or_default())
    }
}

fn known_date(md: &Metadata, name: &str, tsuid: &Tsuid) -> Option<i64> {
    let entry = md.get(name)?;
    let date = entry.as_i64();
    if date.is_none() {
        warn!("{} of {} is not a date ('{}'), ignored", name, tsuid, entry.value);
    }
    date
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::error::IkatsError;
    use crate::model::{FidRecord, MetaEntry};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn setup() -> (Arc<MemoryBackend>, Importer) {
        let backend = Arc::new(MemoryBackend::new());
        let importer = Importer::new(backend.clone()).unwrap();
        (backend, importer)
    }

    fn tsuid(s: &str) -> Tsuid {
        Tsuid::new(s).unwrap()
    }

    fn points(ts: &[i64]) -> Vec<DataPoint> {
        ts.iter().map(|t| DataPoint::new(*t, 1.0)).collect()
    }

    fn value_of(backend: &MemoryBackend, t: &Tsuid, name: &str) -> Option<String> {
        backend.metadata_of(slice::from_ref(t)).unwrap()[t].get(name).map(|e| e.value.clone())
    }

    #[test]
    fn test_non_inheritable_pattern() {
        let (_, importer) = setup();
        assert!(!importer.is_inheritable("qual_nb_points"));
        assert!(!importer.is_inheritable("ikats_start_date"));
        assert!(!importer.is_inheritable("funcId"));
        assert!(importer.is_inheritable("custom_unit"));
        // anchored at the start of the name
        assert!(importer.is_inheritable("my_qual"));
    }

    #[tokio::test]
    async fn test_first_import_writes_intrinsics() {
        let (backend, importer) = setup();
        let t = tsuid("AAA");
        let summary = importer.finalize_import(&t, &points(&[1000, 2000, 3000]), 3, None, true).await.unwrap();
        assert_eq!((summary.start_date, summary.end_date, summary.nb_points), (Some(1000), Some(3000), 3));

        let md = backend.metadata_of(slice::from_ref(&t)).unwrap().remove(&t).unwrap();
        assert_eq!(md.get(META_START_DATE), Some(&MetaEntry::new("1000", MDType::Date)));
        assert_eq!(md.get(META_NB_POINTS), Some(&MetaEntry::new("3", MDType::Number)));
    }

    #[tokio::test]
    async fn test_start_widens_earlier() {
        let (backend, importer) = setup();
        let t = tsuid("AAA");
        backend.create_meta(&t, META_START_DATE, "1000", MDType::Date).unwrap();

        let summary = importer.finalize_import(&t, &points(&[500, 2000]), 2, None, true).await.unwrap();
        assert_eq!((summary.start_date, summary.end_date), (Some(500), Some(2000)));
        assert_eq!(value_of(&backend, &t, META_START_DATE).as_deref(), Some("500"));
    }

    #[tokio::test]
    async fn test_end_never_shrinks() {
        let (backend, importer) = setup();
        let t = tsuid("AAA");
        backend.create_meta(&t, META_END_DATE, "2000", MDType::Date).unwrap();

        let summary = importer.finalize_import(&t, &points(&[1500, 1800]), 2, None, true).await.unwrap();
        assert_eq!(summary.end_date, Some(2000));
        assert_eq!(value_of(&backend, &t, META_END_DATE).as_deref(), Some("2000"));
        assert_eq!(value_of(&backend, &t, META_START_DATE).as_deref(), Some("1500"));
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let (backend, importer) = setup();
        let t = tsuid("AAA");
        let data = points(&[10, 20, 30]);
        importer.finalize_import(&t, &data, 3, None, true).await.unwrap();
        let before = backend.metadata_of(slice::from_ref(&t)).unwrap();
        importer.finalize_import(&t, &data, 3, None, true).await.unwrap();
        assert_eq!(backend.metadata_of(slice::from_ref(&t)).unwrap(), before);
    }

    #[tokio::test]
    async fn test_unparsable_date_counts_as_absent() {
        let (backend, importer) = setup();
        let t = tsuid("AAA");
        backend.create_meta(&t, META_START_DATE, "yesterday", MDType::Date).unwrap();
        let summary = importer.finalize_import(&t, &points(&[42]), 1, None, true).await.unwrap();
        assert_eq!(summary.start_date, Some(42));
        assert_eq!(value_of(&backend, &t, META_START_DATE).as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_empty_points_only_count() {
        let (backend, importer) = setup();
        let t = tsuid("AAA");
        let summary = importer.finalize_import(&t, &[], 0, None, true).await.unwrap();
        assert_eq!(summary.start_date, None);
        assert_eq!(value_of(&backend, &t, META_NB_POINTS).as_deref(), Some("0"));
        assert_eq!(value_of(&backend, &t, META_START_DATE), None);
    }

    #[tokio::test]
    async fn test_partial_count_recorded() {
        let (backend, importer) = setup();
        let t = tsuid("AAA");
        let summary = importer.finalize_import(&t, &points(&[1, 2, 3, 4]), 3, None, true).await.unwrap();
        assert!(summary.is_partial());
        assert_eq!(value_of(&backend, &t, META_NB_POINTS).as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_skip_generation_writes_nothing() {
        let (backend, importer) = setup();
        let t = tsuid("AAA");
        importer.finalize_import(&t, &points(&[1, 2]), 2, None, false).await.unwrap();
        assert!(backend.metadata_of(slice::from_ref(&t)).unwrap()[&t].is_empty());
    }

    #[tokio::test]
    async fn test_inherit_copies_only_inheritable() {
        let (backend, importer) = setup();
        let parent = tsuid("PARENT");
        let child = tsuid("CHILD");
        backend.create_meta(&parent, "qual_nb_points", "10", MDType::Number).unwrap();
        backend.create_meta(&parent, "ikats_start_date", "1", MDType::Date).unwrap();
        backend.create_meta(&parent, "funcId", "parent_fid", MDType::String).unwrap();
        backend.create_meta(&parent, "custom_unit", "m/s", MDType::String).unwrap();

        assert_eq!(importer.inherit(&child, &parent).await, 1);
        let md = backend.metadata_of(slice::from_ref(&child)).unwrap().remove(&child).unwrap();
        assert_eq!(md.keys().collect::<Vec<_>>(), vec!["custom_unit"]);
    }

    #[tokio::test]
    async fn test_finalize_runs_inheritance() {
        let (backend, importer) = setup();
        let parent = tsuid("PARENT");
        let child = tsuid("CHILD");
        backend.create_meta(&parent, "aircraft", "A320", MDType::String).unwrap();
        backend.create_meta(&child, "aircraft", "old", MDType::String).unwrap();

        let summary = importer.finalize_import(&child, &points(&[5]), 1, Some(&parent), true).await.unwrap();
        assert_eq!(summary.inherited, 1);
        assert_eq!(value_of(&backend, &child, "aircraft").as_deref(), Some("A320"));
    }

    // Store whose reads fail, or whose writes fail for one name
    struct FlakyStore {
        inner: MemoryBackend,
        fail_reads: bool,
        refuse: &'static str,
    }

    #[async_trait]
    impl MetadataStore for FlakyStore {
        async fn get_typed(&self, tsuids: &[Tsuid]) -> Result<BTreeMap<Tsuid, Metadata>> {
            if self.fail_reads {
                return Err(IkatsError::Server("down".into()));
            }
            self.inner.metadata_of(tsuids)
        }

        async fn create(&self, tsuid: &Tsuid, name: &str, value: &str, dtype: MDType) -> Result<()> {
            if name == self.refuse {
                return Err(IkatsError::Server("refused".into()));
            }
            self.inner.create_meta(tsuid, name, value, dtype)
        }

        async fn update(&self, tsuid: &Tsuid, name: &str, value: &str) -> Result<()> {
            self.inner.update_meta(tsuid, name, value)
        }

        async fn delete(&self, tsuid: &Tsuid, name: &str) -> Result<()> {
            self.inner.delete_meta(tsuid, name)
        }

        async fn find(&self, constraint: &BTreeMap<String, Vec<String>>) -> Result<Vec<FidRecord>> {
            self.inner.match_meta(constraint)
        }
    }

    #[tokio::test]
    async fn test_inherit_swallows_failures() {
        let parent = tsuid("PARENT");
        let child = tsuid("CHILD");

        let down = FlakyStore { inner: MemoryBackend::new(), fail_reads: true, refuse: "" };
        down.inner.create_meta(&parent, "unit", "m", MDType::String).unwrap();
        let importer = Importer::new(Arc::new(down)).unwrap();
        assert_eq!(importer.inherit(&child, &parent).await, 0);

        let picky = FlakyStore { inner: MemoryBackend::new(), fail_reads: false, refuse: "unit" };
        picky.inner.create_meta(&parent, "unit", "m", MDType::String).unwrap();
        picky.inner.create_meta(&parent, "phase", "8", MDType::Number).unwrap();
        let importer = Importer::new(Arc::new(picky)).unwrap();
        assert_eq!(importer.inherit(&child, &parent).await, 1);
    }
}
