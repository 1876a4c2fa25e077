use crate::error::{IntegrityError, SyncError};
use fastcdc::v2020::{FastCDC, Normalization, StreamCDC};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

/// Chunk boundaries must remain stable across releases: changing these
/// values changes every chunk hash for every file.
pub const MIN_CHUNK_SIZE: u32 = 1024 * 1024;
pub const AVG_CHUNK_SIZE: u32 = 4 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: u32 = 8 * 1024 * 1024;

/// A content-defined chunk of a file, carrying its own body and hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub offset: u64,
    pub length: u32,
    pub hash: String,
    pub data: Vec<u8>,
}

/// Splits `data` into content-defined chunks using FastCDC with the
/// min/avg/max sizes fixed above, and BLAKE3 hashes each chunk.
pub fn chunk_bytes(data: &[u8]) -> Vec<Chunk> {
    if data.is_empty() {
        return Vec::new();
    }

    let chunker = FastCDC::new(data, MIN_CHUNK_SIZE, AVG_CHUNK_SIZE, MAX_CHUNK_SIZE);

    chunker
        .enumerate()
        .map(|(index, entry)| {
            let body = &data[entry.offset..entry.offset + entry.length];
            Chunk {
                index,
                offset: entry.offset as u64,
                length: entry.length as u32,
                hash: crate::crypto::hash(body),
                data: body.to_vec(),
            }
        })
        .collect()
}

/// Streams a file from disk and chunks it without loading the whole file
/// into memory at once.
pub fn chunk_file(path: &Path) -> io::Result<Vec<Chunk>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let chunker = StreamCDC::with_level(
        reader,
        MIN_CHUNK_SIZE,
        AVG_CHUNK_SIZE,
        MAX_CHUNK_SIZE,
        Normalization::Level1,
    );

    let mut chunks = Vec::new();
    for (index, result) in chunker.enumerate() {
        let entry = result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        chunks.push(Chunk {
            index,
            offset: entry.offset,
            length: entry.length as u32,
            hash: crate::crypto::hash(&entry.data),
            data: entry.data,
        });
    }
    Ok(chunks)
}

/// Just the ordered hash list, as sent in upload/metadata calls.
pub fn chunk_hashes(chunks: &[Chunk]) -> Vec<String> {
    chunks.iter().map(|c| c.hash.clone()).collect()
}

/// Concatenates chunk bodies in order, verifying each hash first. Used by
/// the download primitive after fetching and decrypting every chunk.
pub fn reassemble(chunks: &[(String, Vec<u8>)]) -> Result<Vec<u8>, SyncError> {
    let total: usize = chunks.iter().map(|(_, data)| data.len()).sum();
    let mut out = Vec::with_capacity(total);

    for (expected_hash, data) in chunks {
        let actual_hash = crate::crypto::hash(data);
        if &actual_hash != expected_hash {
            return Err(IntegrityError::ContentHashMismatch {
                expected: expected_hash.clone(),
                actual: actual_hash,
            }
            .into());
        }
        out.extend_from_slice(data);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_bytes(&[]).is_empty());
    }

    #[test]
    fn small_input_yields_single_chunk() {
        let data = b"hello\n";
        let chunks = chunk_bytes(data);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].length as usize, data.len());
        assert_eq!(chunks[0].hash, crate::crypto::hash(data));
    }

    #[test]
    fn chunking_is_deterministic() {
        let data = vec![7u8; 3 * MIN_CHUNK_SIZE as usize];
        let first = chunk_bytes(&data);
        let second = chunk_bytes(&data);
        let first_hashes: Vec<_> = first.iter().map(|c| (c.offset, c.length, c.hash.clone())).collect();
        let second_hashes: Vec<_> = second.iter().map(|c| (c.offset, c.length, c.hash.clone())).collect();
        assert_eq!(first_hashes, second_hashes);
    }

    #[test]
    fn reassembly_reproduces_original() {
        let data = vec![3u8; 2 * MIN_CHUNK_SIZE as usize + 512];
        let chunks = chunk_bytes(&data);
        let pairs: Vec<(String, Vec<u8>)> = chunks
            .into_iter()
            .map(|c| (c.hash, c.data))
            .collect();
        let reassembled = reassemble(&pairs).unwrap();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn reassembly_rejects_tampered_chunk() {
        let pairs = vec![("deadbeef".to_string(), b"not matching".to_vec())];
        assert!(reassemble(&pairs).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn reassembly_matches_input(data in proptest::collection::vec(any::<u8>(), 0..(4 * MIN_CHUNK_SIZE as usize))) {
            let chunks = chunk_bytes(&data);
            let pairs: Vec<(String, Vec<u8>)> = chunks.into_iter().map(|c| (c.hash, c.data)).collect();
            let reassembled = reassemble(&pairs).unwrap();
            prop_assert_eq!(reassembled, data);
        }

        #[test]
        fn chunking_is_deterministic_over_random_input(data in proptest::collection::vec(any::<u8>(), 0..(4 * MIN_CHUNK_SIZE as usize))) {
            let a = chunk_bytes(&data);
            let b = chunk_bytes(&data);
            let a_sig: Vec<_> = a.iter().map(|c| (c.offset, c.length, c.hash.clone())).collect();
            let b_sig: Vec<_> = b.iter().map(|c| (c.offset, c.length, c.hash.clone())).collect();
            prop_assert_eq!(a_sig, b_sig);
        }
    }
}
