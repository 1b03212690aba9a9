//! Systematic Reed-Solomon codec over GF(2^8)
//!
//! Thin layer over `reed_solomon_erasure`: shard counts are validated up
//! front, library errors become crate errors, and the volume layout helpers
//! (`split`, `join`, `recover_shard`) live here.

use crate::common::{Error, Result};
use reed_solomon_erasure::galois_8;
use std::fmt;

pub struct ReedSolomon {
    data_shards: usize,
    parity_shards: usize,
    inner: galois_8::ReedSolomon,
}

impl fmt::Debug for ReedSolomon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReedSolomon")
            .field("data_shards", &self.data_shards)
            .field("parity_shards", &self.parity_shards)
            .finish()
    }
}

fn codec_error(err: reed_solomon_erasure::Error) -> Error {
    use reed_solomon_erasure::Error as RsError;
    match err {
        RsError::IncorrectShardSize | RsError::EmptyShard => {
            Error::InvalidArgument("shards differ in size or are empty".into())
        }
        other => Error::InvalidArgument(format!("erasure coding: {:?}", other)),
    }
}

impl ReedSolomon {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(Error::InvalidArgument(
                "data and parity shard counts must be positive".into(),
            ));
        }
        let total = data_shards + parity_shards;
        if total > 256 {
            return Err(Error::InvalidArgument(format!(
                "{} shards exceed the 256 supported by GF(2^8)",
                total
            )));
        }
        let inner = galois_8::ReedSolomon::new(data_shards, parity_shards).map_err(codec_error)?;

        Ok(Self {
            data_shards,
            parity_shards,
            inner,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Compute parity blocks from data blocks. All slices share one length.
    pub fn encode_parts(&self, data: &[&[u8]], parity: &mut [&mut [u8]]) -> Result<()> {
        if data.len() != self.data_shards || parity.len() != self.parity_shards {
            return Err(Error::InvalidArgument(format!(
                "expected {}+{} shards, got {}+{}",
                self.data_shards,
                self.parity_shards,
                data.len(),
                parity.len()
            )));
        }
        self.inner.encode_sep(data, parity).map_err(codec_error)
    }

    /// Fill the parity shards of a full `N+M` shard vector in place.
    pub fn encode(&self, shards: &mut [Vec<u8>]) -> Result<()> {
        self.check_count(shards.len())?;
        self.inner.encode(shards).map_err(codec_error)
    }

    /// Recompute parity and compare with what is stored.
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        self.check_count(shards.len())?;
        self.inner.verify(shards).map_err(codec_error)
    }

    /// Rebuild every missing shard, data and parity.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.check_present(shards)?;
        self.inner.reconstruct(shards).map_err(codec_error)
    }

    /// Rebuild missing data shards only; missing parity stays `None`.
    pub fn reconstruct_data(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.check_present(shards)?;
        self.inner.reconstruct_data(shards).map_err(codec_error)
    }

    /// Rebuild one shard's bytes from any N equally sized ranges.
    pub fn recover_shard(&self, available: &[(usize, &[u8])], target: usize) -> Result<Vec<u8>> {
        if target >= self.total_shards() {
            return Err(Error::InvalidArgument(format!("no shard {}", target)));
        }
        if let Some((_, bytes)) = available.iter().find(|(id, _)| *id == target) {
            return Ok(bytes.to_vec());
        }

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; self.total_shards()];
        for (id, bytes) in available {
            if *id < shards.len() {
                shards[*id] = Some(bytes.to_vec());
            }
        }
        if target < self.data_shards {
            self.reconstruct_data(&mut shards)?;
        } else {
            self.reconstruct(&mut shards)?;
        }
        shards
            .swap_remove(target)
            .ok_or_else(|| Error::Internal(format!("shard {} not rebuilt", target)))
    }

    /// Cut a buffer into N data shards (zero padded) followed by M zeroed
    /// parity shards, ready for `encode`.
    pub fn split(&self, data: &[u8]) -> Vec<Vec<u8>> {
        let shard_len = data.len().div_ceil(self.data_shards).max(1);
        let mut shards = Vec::with_capacity(self.total_shards());
        for i in 0..self.data_shards {
            let mut shard = vec![0u8; shard_len];
            let start = (i * shard_len).min(data.len());
            let end = ((i + 1) * shard_len).min(data.len());
            shard[..end - start].copy_from_slice(&data[start..end]);
            shards.push(shard);
        }
        shards.extend((0..self.parity_shards).map(|_| vec![0u8; shard_len]));
        shards
    }

    /// Concatenate data shards and cut the padding off.
    pub fn join(&self, shards: &[Vec<u8>], len: usize) -> Result<Vec<u8>> {
        if shards.len() < self.data_shards {
            return Err(Error::InsufficientShards {
                needed: self.data_shards,
                available: shards.len(),
            });
        }
        let mut out = Vec::with_capacity(len);
        for shard in &shards[..self.data_shards] {
            out.extend_from_slice(shard);
            if out.len() >= len {
                break;
            }
        }
        if out.len() < len {
            return Err(Error::InvalidArgument(format!(
                "shards hold {} bytes, {} requested",
                out.len(),
                len
            )));
        }
        out.truncate(len);
        Ok(out)
    }

    fn check_count(&self, count: usize) -> Result<()> {
        if count != self.total_shards() {
            return Err(Error::InvalidArgument(format!(
                "expected {} shards, got {}",
                self.total_shards(),
                count
            )));
        }
        Ok(())
    }

    fn check_present(&self, shards: &[Option<Vec<u8>>]) -> Result<()> {
        self.check_count(shards.len())?;
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(Error::InsufficientShards {
                needed: self.data_shards,
                available,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn test_systematic() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let data = sample(400);
        let mut shards = rs.split(&data);
        rs.encode(&mut shards).unwrap();

        // Data shards carry the input unchanged
        assert_eq!(&shards[0][..], &data[..100]);
        assert_eq!(&shards[3][..], &data[300..]);
        assert!(rs.verify(&shards).unwrap());
    }

    #[test]
    fn test_reconstruct_missing_data_and_parity() {
        let rs = ReedSolomon::new(10, 4).unwrap();
        let data = sample(10_000);
        let mut shards = rs.split(&data);
        rs.encode(&mut shards).unwrap();
        let original = shards.clone();

        let mut partial: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for lost in [0, 3, 9, 12] {
            partial[lost] = None;
        }
        rs.reconstruct(&mut partial).unwrap();
        let rebuilt: Vec<Vec<u8>> = partial.into_iter().map(|s| s.unwrap()).collect();
        assert_eq!(rebuilt, original);
        assert_eq!(rs.join(&rebuilt, data.len()).unwrap(), data);
    }

    #[test]
    fn test_reconstruct_data_leaves_parity() {
        let rs = ReedSolomon::new(3, 2).unwrap();
        let mut shards = rs.split(&sample(90));
        rs.encode(&mut shards).unwrap();

        let mut partial: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        partial[1] = None;
        partial[4] = None;
        rs.reconstruct_data(&mut partial).unwrap();
        assert_eq!(partial[1].as_ref().unwrap(), &shards[1]);
        assert!(partial[4].is_none());
    }

    #[test]
    fn test_too_many_missing() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let mut shards = rs.split(&sample(64));
        rs.encode(&mut shards).unwrap();
        let mut partial: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        partial[0] = None;
        partial[1] = None;
        partial[5] = None;
        assert!(matches!(
            rs.reconstruct(&mut partial),
            Err(Error::InsufficientShards {
                needed: 4,
                available: 3
            })
        ));
    }

    #[test]
    fn test_verify_detects_flip() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let mut shards = rs.split(&sample(256));
        rs.encode(&mut shards).unwrap();
        shards[2][17] ^= 0x40;
        assert!(!rs.verify(&shards).unwrap());
    }

    #[test]
    fn test_recover_shard() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let mut shards = rs.split(&sample(120));
        rs.encode(&mut shards).unwrap();

        let available: Vec<(usize, &[u8])> = [1usize, 2, 4, 5]
            .iter()
            .map(|&i| (i, shards[i].as_slice()))
            .collect();
        assert_eq!(rs.recover_shard(&available, 0).unwrap(), shards[0]);
        assert_eq!(rs.recover_shard(&available, 3).unwrap(), shards[3]);
    }

    #[test]
    fn test_split_small_input() {
        let rs = ReedSolomon::new(10, 4).unwrap();
        let shards = rs.split(b"abc");
        assert_eq!(shards.len(), 14);
        assert!(shards.iter().all(|s| s.len() == 1));
        assert_eq!(rs.join(&shards, 3).unwrap(), b"abc");
    }

    #[test]
    fn test_invalid_counts() {
        assert!(ReedSolomon::new(0, 2).is_err());
        assert!(ReedSolomon::new(200, 57).is_err());
        assert!(ReedSolomon::new(200, 56).is_ok());
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let rs = ReedSolomon::new(2, 1).unwrap();
        let mut partial = vec![Some(vec![1u8; 8]), Some(vec![2u8; 4]), None];
        assert!(matches!(
            rs.reconstruct(&mut partial),
            Err(Error::InvalidArgument(_))
        ));
    }
}
