use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use roaring::RoaringBitmap;

use crate::core::{CatalogRecord, LoadError};
use crate::index::text;
use crate::query::matcher::{KeywordMatcher, MatchTier};
use crate::storage::snapshot::DecodedSnapshot;

/// 短查询（<3 字符）没有 trigram 可用，退化为按 rank 顺序扫描。
const TRIGRAM_MIN_CHARS: usize = 3;

/// 一个不可变的快照 generation。
///
/// DocId 即 rank：记录按 (salesSnapshot desc, assetId asc) 排好后顺序编号，
/// 因此任何 posting bitmap 升序迭代天然就是确定性的结果顺序。
pub struct Snapshot {
    generation: u64,
    schema_version: u32,
    source: PathBuf,
    rejected: usize,
    docs: Vec<CatalogRecord>,
    folded: Vec<Box<str>>,
    by_id: HashMap<u64, u32>,
    /// 词 → DocId；BTreeMap 以支持前缀 range
    tokens: BTreeMap<Box<str>, RoaringBitmap>,
    /// trigram → DocId（子串候选）
    trigrams: HashMap<u64, RoaringBitmap>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    pub generation: u64,
    pub records: usize,
    pub rejected: usize,
    pub distinct_tokens: usize,
    pub trigram_keys: usize,
    pub postings_total: u64,
}

fn rank_cmp(a: &CatalogRecord, b: &CatalogRecord) -> std::cmp::Ordering {
    b.sales_snapshot
        .cmp(&a.sales_snapshot)
        .then(a.asset_id.cmp(&b.asset_id))
}

impl Snapshot {
    pub fn build(
        generation: u64,
        decoded: DecodedSnapshot,
        source: &Path,
    ) -> Result<Self, LoadError> {
        let DecodedSnapshot {
            schema_version,
            mut records,
            rejected,
        } = decoded;

        if records.len() > u32::MAX as usize {
            return Err(LoadError::Corrupt(format!(
                "{} records exceed the DocId space",
                records.len()
            )));
        }

        records.par_sort_unstable_by(rank_cmp);
        let folded: Vec<Box<str>> = records
            .par_iter()
            .map(|r| text::fold(&r.name).into_boxed_str())
            .collect();

        let mut by_id = HashMap::with_capacity(records.len());
        let mut tokens: BTreeMap<Box<str>, RoaringBitmap> = BTreeMap::new();
        let mut trigrams: HashMap<u64, RoaringBitmap> = HashMap::new();

        for (doc, (rec, name)) in records.iter().zip(folded.iter()).enumerate() {
            let doc = doc as u32;
            by_id.insert(rec.asset_id, doc);
            for tok in text::tokens(name) {
                match tokens.get_mut(tok) {
                    Some(bm) => {
                        bm.insert(doc);
                    }
                    None => {
                        let mut bm = RoaringBitmap::new();
                        bm.insert(doc);
                        tokens.insert(tok.into(), bm);
                    }
                }
            }
            for tri in text::trigrams(name) {
                trigrams.entry(tri).or_default().insert(doc);
            }
        }

        tracing::info!(
            "Built generation {}: {} records ({} rejected), {} tokens, {} trigrams",
            generation,
            records.len(),
            rejected,
            tokens.len(),
            trigrams.len()
        );

        Ok(Self {
            generation,
            schema_version,
            source: source.to_path_buf(),
            rejected,
            docs: records,
            folded,
            by_id,
            tokens,
            trigrams,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// 加载时的文件路径（校验阶段是临时文件）
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn count(&self) -> u64 {
        self.docs.len() as u64
    }

    pub fn get(&self, asset_id: u64) -> Option<&CatalogRecord> {
        self.by_id
            .get(&asset_id)
            .and_then(|&doc| self.docs.get(doc as usize))
    }

    /// 命中：子串或词前缀；排序：(WordPrefix 优先, salesSnapshot desc, assetId asc)
    pub fn search(&self, query: &str, limit: usize) -> Vec<&CatalogRecord> {
        if limit == 0 {
            return Vec::new();
        }
        let Some(matcher) = KeywordMatcher::new(query) else {
            return Vec::new();
        };

        let mut prefix_docs: Vec<u32> = Vec::new();
        let mut substr_docs: Vec<u32> = Vec::new();

        match matcher.token_prefix() {
            Some(prefix) => {
                // 单词查询：词表 range 直接给出 WordPrefix 集合，无需逐条校验
                let hits = self.prefix_union(prefix);
                prefix_docs.extend(hits.iter().take(limit));
                if prefix_docs.len() < limit {
                    let want = limit - prefix_docs.len();
                    self.collect_candidates(&matcher, |doc, tier| {
                        if tier == MatchTier::Substring && !hits.contains(doc) {
                            substr_docs.push(doc);
                        }
                        substr_docs.len() >= want
                    });
                }
            }
            None => {
                self.collect_candidates(&matcher, |doc, tier| {
                    match tier {
                        MatchTier::WordPrefix => prefix_docs.push(doc),
                        MatchTier::Substring if substr_docs.len() < limit => substr_docs.push(doc),
                        MatchTier::Substring => {}
                    }
                    prefix_docs.len() >= limit
                });
            }
        }

        prefix_docs
            .into_iter()
            .chain(substr_docs)
            .take(limit)
            .filter_map(|doc| self.docs.get(doc as usize))
            .collect()
    }

    fn prefix_union(&self, prefix: &str) -> RoaringBitmap {
        let mut acc = RoaringBitmap::new();
        for (_, bm) in self
            .tokens
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(tok, _)| tok.starts_with(prefix))
        {
            acc |= bm;
        }
        acc
    }

    /// 按 rank 顺序遍历所有真正命中的 doc；`visit` 返回 true 时提前结束。
    fn collect_candidates(
        &self,
        matcher: &KeywordMatcher,
        mut visit: impl FnMut(u32, MatchTier) -> bool,
    ) {
        let mut check = |doc: u32| -> bool {
            match self.folded.get(doc as usize).and_then(|n| matcher.classify(n)) {
                Some(tier) => visit(doc, tier),
                None => false,
            }
        };

        if matcher.char_len() >= TRIGRAM_MIN_CHARS {
            let Some(cands) = self.trigram_candidates(matcher.folded()) else {
                return;
            };
            for doc in cands.iter() {
                if check(doc) {
                    return;
                }
            }
        } else {
            for doc in 0..self.docs.len() as u32 {
                if check(doc) {
                    return;
                }
            }
        }
    }

    /// 所有 trigram posting 的交集；任一 trigram 不存在则无候选
    fn trigram_candidates(&self, folded_query: &str) -> Option<RoaringBitmap> {
        let mut grams: Vec<&RoaringBitmap> = Vec::new();
        for tri in text::trigrams(folded_query) {
            grams.push(self.trigrams.get(&tri)?);
        }
        grams.sort_by_key(|bm| bm.len());
        let (first, rest) = grams.split_first()?;
        let mut acc = (*first).clone();
        for bm in rest {
            acc &= *bm;
            if acc.is_empty() {
                break;
            }
        }
        Some(acc)
    }

    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            generation: self.generation,
            records: self.docs.len(),
            rejected: self.rejected,
            distinct_tokens: self.tokens.len(),
            trigram_keys: self.trigrams.len(),
            postings_total: self
                .tokens
                .values()
                .chain(self.trigrams.values())
                .map(|bm| bm.len())
                .sum(),
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        tracing::debug!("Generation {} released", self.generation);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("generation", &self.generation)
            .field("schema_version", &self.schema_version)
            .field("records", &self.docs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;

    fn snapshot(records: Vec<CatalogRecord>) -> Snapshot {
        let decoded = DecodedSnapshot {
            schema_version: 2,
            records,
            rejected: 0,
        };
        Snapshot::build(1, decoded, Path::new("/tmp/catalog.snap")).unwrap()
    }

    fn ids(hits: Vec<&CatalogRecord>) -> Vec<u64> {
        hits.into_iter().map(|r| r.asset_id).collect()
    }

    #[test]
    fn high_sales_first_among_prefix_hits() {
        let s = snapshot(vec![record(1, "Red Hat", 10), record(2, "Red Cap", 50)]);
        assert_eq!(ids(s.search("red", 10)), vec![2, 1]);
    }

    #[test]
    fn word_prefix_hits_outrank_substring_hits() {
        let s = snapshot(vec![
            record(1, "Chatterbox", 1_000),
            record(2, "Hat of Doom", 5),
            record(3, "Top Hat", 20),
        ]);
        assert_eq!(ids(s.search("hat", 10)), vec![3, 2, 1]);
    }

    #[test]
    fn equal_sales_tie_break_on_asset_id() {
        let s = snapshot(vec![
            record(30, "Blue Hat", 7),
            record(10, "Green Hat", 7),
            record(20, "Pink Hat", 7),
        ]);
        assert_eq!(ids(s.search("hat", 10)), vec![10, 20, 30]);
    }

    #[test]
    fn case_insensitive_substring_and_limit() {
        let s = snapshot(vec![
            record(1, "SPARKLE fedora", 3),
            record(2, "Sparkle Time Fedora", 9),
            record(3, "Bucket", 100),
        ]);
        assert_eq!(ids(s.search("FeDoRa", 10)), vec![2, 1]);
        assert_eq!(ids(s.search("edor", 10)), vec![2, 1]);
        assert_eq!(ids(s.search("fedora", 1)), vec![2]);
        assert!(s.search("fedora", 0).is_empty());
    }

    #[test]
    fn short_query_scans_in_rank_order() {
        let s = snapshot(vec![
            record(1, "Ox", 1),
            record(2, "Box", 2),
            record(3, "Fox", 3),
        ]);
        assert_eq!(ids(s.search("ox", 10)), vec![1, 3, 2]);
        assert_eq!(ids(s.search("x", 10)), vec![3, 2, 1]);
    }

    #[test]
    fn multi_word_query_matches_as_substring() {
        let s = snapshot(vec![
            record(1, "Big Red Hat", 1),
            record(2, "Red Hatchet", 2),
            record(3, "Hat Red", 3),
        ]);
        assert_eq!(ids(s.search("red hat", 10)), vec![2, 1]);
    }

    #[test]
    fn blank_and_unmatched_queries_are_empty() {
        let s = snapshot(vec![record(1, "Red Hat", 10)]);
        assert!(s.search("   ", 10).is_empty());
        assert!(s.search("zzz", 10).is_empty());
    }

    #[test]
    fn repeated_search_is_identical() {
        let records: Vec<CatalogRecord> = (0..500)
            .map(|i| record(i, &format!("Hat Style {}", i % 37), i % 11))
            .collect();
        let s = snapshot(records);
        let first = ids(s.search("hat", 10));
        assert_eq!(first.len(), 10);
        for _ in 0..20 {
            assert_eq!(ids(s.search("hat", 10)), first);
        }
    }

    #[test]
    fn get_and_count() {
        let s = snapshot(vec![record(1, "Red Hat", 10), record(2, "Red Cap", 50)]);
        assert_eq!(s.count(), 2);
        assert_eq!(s.get(1).map(|r| r.name.as_str()), Some("Red Hat"));
        assert!(s.get(3).is_none());
        let st = s.stats();
        assert_eq!(st.records, 2);
        assert_eq!(st.distinct_tokens, 3);
    }
}
