//! Aggregate database statistics stored with every revision.
//!
//! Only counts and totals are exact. The length and wdf bounds are cheap
//! conservative bounds: upper bounds only grow (until the corpus empties) and
//! the lower bound is only ever driven down.

use crate::error::{GlassError, Result};
use crate::pack::{pack_uint, pack_uint_last, unpack_u32, unpack_uint_last};
use crate::{DocCount, DocId, TermCount, TotalLength};
use serde::{Deserialize, Serialize};

/// Document counts, length totals and bounds for one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub doc_count: DocCount,
    pub total_doc_length: TotalLength,
    /// Highest document id ever allocated. Never decreases.
    pub last_docid: DocId,
    /// Lower bound on the length of any document with non-zero length.
    pub doclen_lower_bound: TermCount,
    pub doclen_upper_bound: TermCount,
    pub wdf_upper_bound: TermCount,
    pub spelling_wordfreq_upper_bound: TermCount,
}

/// Smaller of two values, treating 0 as "no value yet".
fn min_non_zero(a: TermCount, b: TermCount) -> TermCount {
    match (a, b) {
        (0, x) | (x, 0) => x,
        (x, y) => x.min(y),
    }
}

impl DatabaseStats {
    /// Account for a newly added document of length `doclen`.
    pub fn add_document(&mut self, doclen: TermCount) -> Result<()> {
        let doc_count = self
            .doc_count
            .checked_add(1)
            .ok_or_else(|| GlassError::Consistency("document count overflow".into()))?;
        let total = self
            .total_doc_length
            .checked_add(TotalLength::from(doclen))
            .ok_or_else(|| GlassError::Consistency("total document length overflow".into()))?;
        self.doc_count = doc_count;
        self.total_doc_length = total;
        self.doclen_lower_bound = min_non_zero(self.doclen_lower_bound, doclen);
        self.doclen_upper_bound = self.doclen_upper_bound.max(doclen);
        Ok(())
    }

    /// Account for the removal of a document of length `doclen`.
    ///
    /// Once no postings remain the bounds are reset, since they no longer
    /// describe anything.
    pub fn delete_document(&mut self, doclen: TermCount) -> Result<()> {
        let doc_count = self.doc_count.checked_sub(1).ok_or_else(|| {
            GlassError::Consistency("delete_document on an empty database".into())
        })?;
        let total = self
            .total_doc_length
            .checked_sub(TotalLength::from(doclen))
            .ok_or_else(|| {
                GlassError::Consistency(format!(
                    "document length {} exceeds total length {}",
                    doclen, self.total_doc_length
                ))
            })?;
        self.doc_count = doc_count;
        self.total_doc_length = total;
        if total == 0 {
            self.doclen_lower_bound = 0;
            self.doclen_upper_bound = 0;
            self.wdf_upper_bound = 0;
        }
        Ok(())
    }

    /// Raise the wdf upper bound to cover `wdf`.
    pub fn check_wdf(&mut self, wdf: TermCount) {
        if wdf > self.wdf_upper_bound {
            self.wdf_upper_bound = wdf;
        }
    }

    /// Allocate the next document id. Ids are never reused.
    pub fn next_docid(&mut self) -> Result<DocId> {
        self.last_docid = self
            .last_docid
            .checked_add(1)
            .ok_or_else(|| GlassError::Consistency("document ids exhausted".into()))?;
        Ok(self.last_docid)
    }

    /// Lower bound on the number of distinct terms in any non-empty document.
    pub fn unique_terms_lower_bound(&self) -> TermCount {
        if self.total_doc_length == 0 || self.wdf_upper_bound == 0 {
            return 0;
        }
        (self.doclen_lower_bound.saturating_sub(1)) / self.wdf_upper_bound + 1
    }

    /// Fold another database's statistics into these, as when compacting
    /// several databases into one.
    ///
    /// The other database's document ids are rebased to follow ours, so
    /// `last_docid` becomes the sum of both.
    pub fn merge(&mut self, other: &DatabaseStats) -> Result<()> {
        let overflow = |what: &str| GlassError::Consistency(format!("{} overflow in merge", what));
        let doc_count = self
            .doc_count
            .checked_add(other.doc_count)
            .ok_or_else(|| overflow("document count"))?;
        let total = self
            .total_doc_length
            .checked_add(other.total_doc_length)
            .ok_or_else(|| overflow("total document length"))?;
        let last_docid = self
            .last_docid
            .checked_add(other.last_docid)
            .ok_or_else(|| overflow("last document id"))?;

        self.doc_count = doc_count;
        self.total_doc_length = total;
        self.last_docid = last_docid;
        self.doclen_lower_bound = min_non_zero(self.doclen_lower_bound, other.doclen_lower_bound);
        self.doclen_upper_bound = self.doclen_upper_bound.max(other.doclen_upper_bound);
        self.wdf_upper_bound = self.wdf_upper_bound.max(other.wdf_upper_bound);
        self.spelling_wordfreq_upper_bound = self
            .spelling_wordfreq_upper_bound
            .max(other.spelling_wordfreq_upper_bound);
        Ok(())
    }

    /// Encode the stats block. It is always the last field of a version blob,
    /// so the total length uses the unterminated trailing encoding.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        // Every live document holds a distinct id <= last_docid.
        let docid_gap = self.last_docid.checked_sub(self.doc_count).ok_or_else(|| {
            GlassError::Consistency(format!(
                "last_docid {} is below doc_count {}",
                self.last_docid, self.doc_count
            ))
        })?;
        let mut buf = Vec::with_capacity(24);
        pack_uint(&mut buf, u64::from(self.doc_count));
        pack_uint(&mut buf, u64::from(docid_gap));
        pack_uint(&mut buf, u64::from(self.doclen_lower_bound));
        pack_uint(&mut buf, u64::from(self.wdf_upper_bound));
        pack_uint(&mut buf, u64::from(self.doclen_upper_bound));
        pack_uint(&mut buf, u64::from(self.spelling_wordfreq_upper_bound));
        pack_uint_last(&mut buf, self.total_doc_length);
        Ok(buf)
    }

    /// Decode a stats block, consuming the rest of `cursor`.
    pub fn unserialize(cursor: &mut &[u8]) -> Option<Self> {
        let doc_count = unpack_u32(cursor)?;
        let docid_gap = unpack_u32(cursor)?;
        let doclen_lower_bound = unpack_u32(cursor)?;
        let wdf_upper_bound = unpack_u32(cursor)?;
        let doclen_upper_bound = unpack_u32(cursor)?;
        let spelling_wordfreq_upper_bound = unpack_u32(cursor)?;
        let total_doc_length = unpack_uint_last(cursor)?;
        let last_docid = doc_count.checked_add(docid_gap)?;
        Some(Self {
            doc_count,
            total_doc_length,
            last_docid,
            doclen_lower_bound,
            doclen_upper_bound,
            wdf_upper_bound,
            spelling_wordfreq_upper_bound,
        })
    }
}
