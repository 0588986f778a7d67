//! Crawl item contract.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::key::{ItemKey, KeyDeriver};
use crate::error::{AppError, Result};

/// Anything the crawler discovers and may want to process once.
///
/// `identity` must be deterministic for semantically identical items.
/// `cursor` is the item's position in the source enumeration.
pub trait CrawlItem {
    fn identity(&self) -> Cow<'_, str>;

    fn cursor(&self) -> u64;

    /// Dedup key. Defaults to the engine's derivation of `identity`; item
    /// types with their own identity scheme override it.
    fn key(&self, deriver: &KeyDeriver) -> Result<ItemKey> {
        deriver.derive(&self.identity())
    }
}

/// A discovered page, identified by its URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageItem {
    pub url: String,
    pub cursor: u64,
}

impl PageItem {
    pub fn new(url: impl Into<String>, cursor: u64) -> Self {
        Self {
            url: url.into(),
            cursor,
        }
    }
}

impl CrawlItem for PageItem {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.url)
    }

    fn cursor(&self) -> u64 {
        self.cursor
    }
}

/// Scheduler sequence tag: `JOBSEQ=0000000012` for job 12, and
/// `JOBSEQ=0000000012.r2` for its second retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct JobSeq {
    pub seq: u64,
    pub repetition: u32,
}

impl JobSeq {
    pub const TAG_PREFIX: &'static str = "JOBSEQ=";

    pub fn new(seq: u64) -> Self {
        Self { seq, repetition: 0 }
    }

    /// Same sequence, one more repetition.
    pub fn retry(self) -> Self {
        Self {
            seq: self.seq,
            repetition: self.repetition + 1,
        }
    }

    pub fn parse(tag: &str) -> Result<Self> {
        let bad = || AppError::validation(format!("malformed job sequence tag '{tag}'"));
        let value = tag.strip_prefix(Self::TAG_PREFIX).ok_or_else(bad)?;
        let (seq, repetition) = match value.split_once(".r") {
            Some((seq, rep)) => (seq, rep.parse().map_err(|_| bad())?),
            None => (value, 0),
        };
        Ok(Self {
            seq: seq.parse().map_err(|_| bad())?,
            repetition,
        })
    }

    /// The first sequence tag among `tags`, if any.
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Result<Option<Self>> {
        tags.iter()
            .map(|t| t.as_ref())
            .find(|t| t.starts_with(Self::TAG_PREFIX))
            .map(Self::parse)
            .transpose()
    }

    pub fn tag(&self) -> String {
        format!("{}{}", Self::TAG_PREFIX, self)
    }
}

impl fmt::Display for JobSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010}", self.seq)?;
        if self.repetition > 0 {
            write!(f, ".r{}", self.repetition)?;
        }
        Ok(())
    }
}

/// A scheduled spider job, identified by its spider name and arguments.
///
/// Two jobs with the same spider and the same argument values (compared as
/// strings, in any order) share a key, so a manager can skip rescheduling
/// work it already launched. The key is the argument fingerprint whatever
/// the engine's identity kind, so pages and jobs can share one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiderJob {
    pub spider: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Sequence number assigned by the scheduler
    #[serde(default)]
    pub seq: u64,
    /// Retries of the same sequence number
    #[serde(default)]
    pub repetition: u32,
}

impl SpiderJob {
    pub fn new(spider: impl Into<String>, seq: u64) -> Self {
        Self {
            spider: spider.into(),
            args: BTreeMap::new(),
            seq,
            repetition: 0,
        }
    }

    /// Job carrying the sequence found in scheduler `tags`; zero when none.
    pub fn from_tags<S: AsRef<str>>(spider: impl Into<String>, tags: &[S]) -> Result<Self> {
        let jobseq = JobSeq::from_tags(tags)?.unwrap_or_default();
        Ok(Self::new(spider, jobseq.seq).with_jobseq(jobseq))
    }

    pub fn with_jobseq(mut self, jobseq: JobSeq) -> Self {
        self.seq = jobseq.seq;
        self.repetition = jobseq.repetition;
        self
    }

    pub fn jobseq(&self) -> JobSeq {
        JobSeq {
            seq: self.seq,
            repetition: self.repetition,
        }
    }

    /// The same job scheduled again. Key and cursor are unchanged.
    pub fn retried(&self) -> Self {
        self.clone().with_jobseq(self.jobseq().retry())
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.args.insert(name.into(), value.to_string());
        self
    }

    /// Fingerprint over the spider name and arguments.
    pub fn fingerprint(&self) -> ItemKey {
        ItemKey::from_params(
            self.args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .chain(std::iter::once(("spider".to_string(), self.spider.clone()))),
        )
    }
}

impl CrawlItem for SpiderJob {
    fn identity(&self) -> Cow<'_, str> {
        Cow::Owned(self.fingerprint().to_string())
    }

    fn cursor(&self) -> u64 {
        self.seq
    }

    fn key(&self, _deriver: &KeyDeriver) -> Result<ItemKey> {
        Ok(self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IdentityKind;

    #[test]
    fn test_spider_job_fingerprint_ignores_seq() {
        let a = SpiderJob::new("books", 1).arg("category", "fiction").arg("page", 3);
        let b = SpiderJob::new("books", 7).arg("page", "3").arg("category", "fiction");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.cursor(), b.cursor());
    }

    #[test]
    fn test_spider_name_is_part_of_identity() {
        let a = SpiderJob::new("books", 1).arg("page", 1);
        let b = SpiderJob::new("movies", 1).arg("page", 1);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_spider_job_key_ignores_identity_kind() {
        let job = SpiderJob::new("books", 1).arg("page", 1);
        let url = KeyDeriver::new(IdentityKind::Url);
        let raw = KeyDeriver::new(IdentityKind::Raw);
        assert_eq!(job.key(&url).unwrap(), job.fingerprint());
        assert_eq!(job.key(&raw).unwrap(), job.fingerprint());
    }

    #[test]
    fn test_jobseq_tags() {
        let first = JobSeq::new(12);
        assert_eq!(first.tag(), "JOBSEQ=0000000012");
        assert_eq!(first.retry().retry().tag(), "JOBSEQ=0000000012.r2");

        let tags = ["priority=high", "JOBSEQ=0000000012.r3"];
        let parsed = JobSeq::from_tags(&tags).unwrap().unwrap();
        assert_eq!(parsed, JobSeq { seq: 12, repetition: 3 });
        assert_eq!(JobSeq::parse("JOBSEQ=0000000007").unwrap(), JobSeq::new(7));
        assert!(JobSeq::from_tags(&["other"]).unwrap().is_none());
        assert!(JobSeq::parse("JOBSEQ=abc.r1").is_err());
    }

    #[test]
    fn test_retried_job_keeps_key_and_cursor() {
        let job = SpiderJob::from_tags("books", &["JOBSEQ=0000000004"])
            .unwrap()
            .arg("page", 2);
        let retry = job.retried();
        assert_eq!(retry.jobseq().tag(), "JOBSEQ=0000000004.r1");
        assert_eq!(retry.fingerprint(), job.fingerprint());
        assert_eq!(retry.cursor(), 4);
    }

    #[test]
    fn test_page_item_identity_is_url() {
        let item = PageItem::new("https://example.com/a", 12);
        assert_eq!(item.identity(), "https://example.com/a");
        assert_eq!(item.cursor(), 12);
    }
}
