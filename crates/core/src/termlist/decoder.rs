use super::{PostingSource, TermListTable};
use crate::error::{GlassError, Result};
use crate::pack::{take_bytes, unpack_u32};
use crate::{DocCount, DocId, TermCount};

/// Where a [`TermListDecoder`] is in its list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermListState {
    /// Header decoded, no entry read yet.
    BeforeFirst,
    /// Positioned on a valid entry.
    Positioned,
    /// Past the last entry.
    AtEnd,
}

/// Stateful forward cursor over one document's encoded termlist.
///
/// Never modifies the blob. Collection frequencies are fetched from the
/// postings source only when asked for, and cached per entry.
pub struct TermListDecoder<'a, P: PostingSource + ?Sized> {
    postings: &'a P,
    did: DocId,
    doc_length: TermCount,
    unique_terms: TermCount,
    data: Vec<u8>,
    pos: usize,
    state: TermListState,
    current_term: Vec<u8>,
    current_wdf: TermCount,
    current_termfreq: Option<DocCount>,
}

fn take_byte(cursor: &mut &[u8]) -> Option<usize> {
    take_bytes(cursor, 1).map(|b| usize::from(b[0]))
}

fn corrupt(did: DocId, detail: &str) -> GlassError {
    GlassError::format("termlist", format!("document {}: {}", did, detail))
}

impl<'a, P: PostingSource + ?Sized> TermListDecoder<'a, P> {
    /// Look up and start decoding the termlist of `did`.
    ///
    /// A missing document fails with [`GlassError::DocumentNotFound`] when
    /// `throw_if_not_present` is set; otherwise the decoder is returned
    /// already at its end.
    pub fn open<T: TermListTable + ?Sized>(
        table: &T,
        postings: &'a P,
        did: DocId,
        throw_if_not_present: bool,
    ) -> Result<Self> {
        match table.termlist(did)? {
            Some(data) => Self::from_encoded(postings, did, data),
            None if throw_if_not_present => Err(GlassError::DocumentNotFound(did)),
            None => Ok(Self {
                postings,
                did,
                doc_length: 0,
                unique_terms: 0,
                data: Vec::new(),
                pos: 0,
                state: TermListState::AtEnd,
                current_term: Vec::new(),
                current_wdf: 0,
                current_termfreq: None,
            }),
        }
    }

    /// Start decoding an already fetched termlist blob.
    pub fn from_encoded(postings: &'a P, did: DocId, data: Vec<u8>) -> Result<Self> {
        let (doc_length, unique_terms, pos) = if data.is_empty() {
            (0, 0, 0)
        } else {
            let mut cursor = data.as_slice();
            let doc_length =
                unpack_u32(&mut cursor).ok_or_else(|| corrupt(did, "bad document length"))?;
            let unique_terms =
                unpack_u32(&mut cursor).ok_or_else(|| corrupt(did, "bad termlist size"))?;
            (doc_length, unique_terms, data.len() - cursor.len())
        };
        Ok(Self {
            postings,
            did,
            doc_length,
            unique_terms,
            data,
            pos,
            state: TermListState::BeforeFirst,
            current_term: Vec::new(),
            current_wdf: 0,
            current_termfreq: None,
        })
    }

    pub fn doc_id(&self) -> DocId {
        self.did
    }

    pub fn doc_length(&self) -> TermCount {
        self.doc_length
    }

    /// Number of distinct terms in the document.
    pub fn unique_terms(&self) -> TermCount {
        self.unique_terms
    }

    /// Size estimate used by query planning. Exact for this format.
    pub fn approx_size(&self) -> TermCount {
        self.unique_terms
    }

    pub fn state(&self) -> TermListState {
        self.state
    }

    pub fn at_end(&self) -> bool {
        self.state == TermListState::AtEnd
    }

    /// The current term, or `None` unless positioned on an entry.
    pub fn term(&self) -> Option<&[u8]> {
        match self.state {
            TermListState::Positioned => Some(&self.current_term),
            _ => None,
        }
    }

    /// The current term's within-document frequency.
    pub fn wdf(&self) -> Option<TermCount> {
        match self.state {
            TermListState::Positioned => Some(self.current_wdf),
            _ => None,
        }
    }

    /// Collection frequency of the current term, looked up on first use.
    pub fn termfreq(&mut self) -> Result<DocCount> {
        if self.state != TermListState::Positioned {
            return Err(GlassError::Consistency(format!(
                "termfreq requested while termlist of document {} is not positioned",
                self.did
            )));
        }
        if let Some(freq) = self.current_termfreq {
            return Ok(freq);
        }
        let freq = self.postings.term_frequency(&self.current_term)?;
        self.current_termfreq = Some(freq);
        Ok(freq)
    }

    /// Move to the next entry, or to the end. A no-op once at the end.
    pub fn next(&mut self) -> Result<()> {
        if self.state == TermListState::AtEnd {
            return Ok(());
        }
        if self.pos == self.data.len() {
            self.state = TermListState::AtEnd;
            self.current_term.clear();
            self.current_termfreq = None;
            return Ok(());
        }

        let did = self.did;
        let mut cursor = &self.data[self.pos..];
        let mut wdf_folded = false;
        if self.state == TermListState::Positioned {
            let mut reuse = take_byte(&mut cursor).ok_or_else(|| corrupt(did, "truncated entry"))?;
            let prev_len = self.current_term.len();
            if reuse > prev_len {
                let divisor = prev_len + 1;
                self.current_wdf = (reuse / divisor - 1) as TermCount;
                reuse %= divisor;
                wdf_folded = true;
            }
            self.current_term.truncate(reuse);
        }

        let suffix_len = take_byte(&mut cursor).ok_or_else(|| corrupt(did, "truncated entry"))?;
        let suffix =
            take_bytes(&mut cursor, suffix_len).ok_or_else(|| corrupt(did, "truncated term"))?;
        self.current_term.extend_from_slice(suffix);

        if !wdf_folded {
            self.current_wdf = unpack_u32(&mut cursor).ok_or_else(|| corrupt(did, "bad wdf"))?;
        }
        self.pos = self.data.len() - cursor.len();
        self.current_termfreq = None;
        self.state = TermListState::Positioned;
        Ok(())
    }

    /// Advance to the first entry whose term is `>= term`.
    ///
    /// Behaves exactly like calling [`next`](Self::next) until that holds; a
    /// decoder already positioned at or past `term` does not move.
    pub fn skip_to(&mut self, term: &[u8]) -> Result<()> {
        if self.state == TermListState::BeforeFirst {
            self.next()?;
        }
        while self.state == TermListState::Positioned && self.current_term.as_slice() < term {
            self.next()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::termlist::encode_termlist;
    use std::cell::Cell;
    use std::collections::HashMap;

    /// Postings source which counts how often it is consulted.
    struct CountingPostings {
        freqs: HashMap<Vec<u8>, DocCount>,
        lookups: Cell<usize>,
    }

    impl CountingPostings {
        fn new(pairs: &[(&str, DocCount)]) -> Self {
            Self {
                freqs: pairs
                    .iter()
                    .map(|(t, f)| (t.as_bytes().to_vec(), *f))
                    .collect(),
                lookups: Cell::new(0),
            }
        }
    }

    impl PostingSource for CountingPostings {
        fn term_frequency(&self, term: &[u8]) -> Result<DocCount> {
            self.lookups.set(self.lookups.get() + 1);
            Ok(self.freqs.get(term).copied().unwrap_or(0))
        }
    }

    struct OneDoc(DocId, Vec<u8>);

    impl TermListTable for OneDoc {
        fn termlist(&self, did: DocId) -> Result<Option<Vec<u8>>> {
            Ok((did == self.0).then(|| self.1.clone()))
        }
    }

    fn apple_banana() -> Vec<u8> {
        encode_termlist(3, &[("apple", 2), ("banana", 1)]).unwrap()
    }

    #[test]
    fn test_walks_entries_in_order() {
        let postings = CountingPostings::new(&[]);
        let mut tl = TermListDecoder::from_encoded(&postings, 7, apple_banana()).unwrap();
        assert_eq!(tl.state(), TermListState::BeforeFirst);
        assert_eq!(tl.doc_length(), 3);
        assert_eq!(tl.unique_terms(), 2);
        assert_eq!(tl.term(), None);

        tl.next().unwrap();
        assert_eq!(tl.term(), Some(&b"apple"[..]));
        assert_eq!(tl.wdf(), Some(2));

        tl.next().unwrap();
        assert_eq!(tl.term(), Some(&b"banana"[..]));
        assert_eq!(tl.wdf(), Some(1));

        tl.next().unwrap();
        assert!(tl.at_end());
        assert_eq!(tl.term(), None);

        tl.next().unwrap();
        assert!(tl.at_end(), "next() at the end stays at the end");
    }

    #[test]
    fn test_skip_to_from_before_first() {
        let postings = CountingPostings::new(&[]);
        let mut tl = TermListDecoder::from_encoded(&postings, 1, apple_banana()).unwrap();
        tl.skip_to(b"banana").unwrap();
        assert_eq!(tl.term(), Some(&b"banana"[..]));
        assert_eq!(tl.wdf(), Some(1));
    }

    #[test]
    fn test_skip_to_between_terms_and_past_end() {
        let postings = CountingPostings::new(&[]);
        let mut tl = TermListDecoder::from_encoded(&postings, 1, apple_banana()).unwrap();
        tl.skip_to(b"b").unwrap();
        assert_eq!(tl.term(), Some(&b"banana"[..]));
        tl.skip_to(b"a").unwrap();
        assert_eq!(tl.term(), Some(&b"banana"[..]), "skip_to never moves backwards");
        tl.skip_to(b"zzz").unwrap();
        assert!(tl.at_end());
    }

    #[test]
    fn test_skip_to_empty_term_positions_on_first() {
        let postings = CountingPostings::new(&[]);
        let mut tl = TermListDecoder::from_encoded(&postings, 1, apple_banana()).unwrap();
        tl.skip_to(b"").unwrap();
        assert_eq!(tl.term(), Some(&b"apple"[..]));
    }

    #[test]
    fn test_front_coding_with_shared_prefixes() {
        let entries = [
            ("car", 1u32),
            ("card", 4),
            ("care", 200),
            ("cared", 1),
            ("zebra", 127),
        ];
        let blob = encode_termlist(333, &entries).unwrap();
        let postings = CountingPostings::new(&[]);
        let mut tl = TermListDecoder::from_encoded(&postings, 9, blob).unwrap();
        for (term, wdf) in entries {
            tl.next().unwrap();
            assert_eq!(tl.term(), Some(term.as_bytes()));
            assert_eq!(tl.wdf(), Some(wdf));
        }
        tl.next().unwrap();
        assert!(tl.at_end());
    }

    #[test]
    fn test_termfreq_is_fetched_once_per_entry() {
        let postings = CountingPostings::new(&[("apple", 40), ("banana", 3)]);
        let mut tl = TermListDecoder::from_encoded(&postings, 1, apple_banana()).unwrap();
        assert!(tl.termfreq().is_err(), "no entry yet");
        tl.next().unwrap();
        assert_eq!(tl.termfreq().unwrap(), 40);
        assert_eq!(tl.termfreq().unwrap(), 40);
        assert_eq!(postings.lookups.get(), 1);
        tl.next().unwrap();
        assert_eq!(tl.termfreq().unwrap(), 3);
        assert_eq!(postings.lookups.get(), 2);
    }

    #[test]
    fn test_missing_document_behaviour() {
        let table = OneDoc(5, apple_banana());
        let postings = CountingPostings::new(&[]);
        let err = TermListDecoder::open(&table, &postings, 6, true).err();
        assert!(matches!(err, Some(GlassError::DocumentNotFound(6))));

        let tl = TermListDecoder::open(&table, &postings, 6, false).unwrap();
        assert!(tl.at_end());

        let tl = TermListDecoder::open(&table, &postings, 5, true).unwrap();
        assert_eq!(tl.state(), TermListState::BeforeFirst);
    }

    #[test]
    fn test_empty_blob_has_no_terms() {
        let postings = CountingPostings::new(&[]);
        let mut tl = TermListDecoder::from_encoded(&postings, 1, Vec::new()).unwrap();
        assert_eq!(tl.doc_length(), 0);
        tl.next().unwrap();
        assert!(tl.at_end());
    }

    #[test]
    fn test_truncated_blob_is_format_error() {
        let blob = apple_banana();
        let postings = CountingPostings::new(&[]);
        let mut tl =
            TermListDecoder::from_encoded(&postings, 1, blob[..blob.len() - 3].to_vec()).unwrap();
        tl.next().unwrap();
        assert!(matches!(tl.next(), Err(GlassError::Format { .. })));
    }
}
