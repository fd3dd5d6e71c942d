//! Per-document termlists: the sorted `(term, wdf)` pairs of one document,
//! front-coded into a single blob stored in the termlist table.
//!
//! Blob layout: `doc_length` and the entry count as varints, then one entry
//! per term. The first entry is `[len][term][wdf varint]`. Later entries
//! share a prefix with their predecessor and are written as
//! `[reuse][suffix len][suffix]` followed by the wdf, except that a small wdf
//! is folded into the reuse byte as `(wdf + 1) * (prev_len + 1) + reuse`.
//! A folded byte is always larger than `prev_len`, which is how the decoder
//! tells the two forms apart.

/// Forward cursor over an encoded termlist.
pub mod decoder;

pub use decoder::{TermListDecoder, TermListState};

use crate::config::MAX_TERM_LENGTH;
use crate::error::{GlassError, Result};
use crate::pack::pack_uint;
use crate::{DocCount, DocId, TermCount};

/// Lookup of encoded termlists by document id.
pub trait TermListTable {
    /// The encoded termlist of `did`, or `None` if the document does not exist.
    fn termlist(&self, did: DocId) -> Result<Option<Vec<u8>>>;
}

/// Lookup of collection-wide term frequencies in the postings table.
pub trait PostingSource {
    /// Number of documents indexed by `term`.
    fn term_frequency(&self, term: &[u8]) -> Result<DocCount>;
}

/// Key of a document's termlist in the termlist table. Big-endian so keys
/// sort in document id order.
pub fn termlist_key(did: DocId) -> [u8; 4] {
    did.to_be_bytes()
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Encode a document's termlist. `entries` must be strictly ascending by
/// byte order, and every term must be 1..=`MAX_TERM_LENGTH` bytes long.
pub fn encode_termlist<T: AsRef<[u8]>>(
    doc_length: TermCount,
    entries: &[(T, TermCount)],
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + entries.len() * 8);
    pack_uint(&mut buf, u64::from(doc_length));
    pack_uint(&mut buf, entries.len() as u64);

    let mut prev: &[u8] = &[];
    for (term, wdf) in entries {
        let term = term.as_ref();
        if term.is_empty() || term.len() > MAX_TERM_LENGTH {
            return Err(GlassError::Consistency(format!(
                "term length {} outside 1..={}",
                term.len(),
                MAX_TERM_LENGTH
            )));
        }
        if prev.is_empty() {
            buf.push(term.len() as u8);
            buf.extend_from_slice(term);
            pack_uint(&mut buf, u64::from(*wdf));
        } else {
            if term <= prev {
                return Err(GlassError::Consistency(
                    "termlist entries must be strictly ascending".into(),
                ));
            }
            let reuse = common_prefix_len(prev, term);
            let suffix = &term[reuse..];
            // Large wdfs can't be folded; skip the multiply so it can't overflow.
            let folded = if *wdf < 127 {
                (*wdf as usize + 1) * (prev.len() + 1) + reuse
            } else {
                usize::MAX
            };
            if folded < 256 {
                buf.push(folded as u8);
                buf.push(suffix.len() as u8);
                buf.extend_from_slice(suffix);
            } else {
                buf.push(reuse as u8);
                buf.push(suffix.len() as u8);
                buf.extend_from_slice(suffix);
                pack_uint(&mut buf, u64::from(*wdf));
            }
        }
        prev = term;
    }
    Ok(buf)
}
