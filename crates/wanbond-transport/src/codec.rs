//! # FEC codec
//!
//! Systematic forward error correction: `k` data shards plus `m` parity
//! shards, any `<= m` erasures among the `k + m` shards are recoverable.
//!
//! The parity shards come from a systematic Reed-Solomon generator matrix
//! over GF(2^8): row `j` of the parity block is
//! `parity[j] = sum_i (alpha_i^j * data[i])`, evaluated independently at
//! every byte offset. For `m == 1` this reduces exactly to a single XOR of
//! all data shards (`alpha_i^0 == 1` for every `i`, so row 0 is just the
//! XOR). For `m > 1` the full Vandermonde/Gaussian-elimination machinery
//! recovers any erasure pattern up to `m` losses, which a bare XOR parity
//! cannot do.

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FecError {
    #[error("k and m must both be greater than zero")]
    InvalidShape,
    #[error("wrong number of shards for this k/m")]
    WrongShardCount,
    #[error("more than m shards are missing — group is unrecoverable")]
    Unrecoverable,
}

// ─── GF(2^8) arithmetic ──────────────────────────────────────────────────────

mod gf {
    /// Primitive polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11D), the standard
    /// generator used by Reed-Solomon codes.
    const PRIMITIVE_POLY: u16 = 0x11D;

    pub struct Tables {
        pub exp: [u8; 512],
        pub log: [u8; 256],
    }

    pub fn build_tables() -> Tables {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255usize {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= PRIMITIVE_POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Tables { exp, log }
    }

    pub fn mul(tables: &Tables, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let la = tables.log[a as usize] as usize;
        let lb = tables.log[b as usize] as usize;
        tables.exp[la + lb]
    }

    pub fn inv(tables: &Tables, a: u8) -> u8 {
        assert!(a != 0, "GF(256) inverse of zero is undefined");
        let la = tables.log[a as usize] as usize;
        tables.exp[255 - la]
    }

    pub fn pow(tables: &Tables, a: u8, e: usize) -> u8 {
        if a == 0 {
            return if e == 0 { 1 } else { 0 };
        }
        let la = tables.log[a as usize] as usize;
        tables.exp[(la * e) % 255]
    }
}

fn tables() -> &'static gf::Tables {
    use std::sync::OnceLock;
    static TABLES: OnceLock<gf::Tables> = OnceLock::new();
    TABLES.get_or_init(gf::build_tables)
}

// ─── Generator matrix ────────────────────────────────────────────────────────

/// `alpha_i = i + 1` for `i` in `0..k` — k distinct nonzero field elements,
/// valid as long as `k < 255`.
fn eval_points(k: usize) -> Vec<u8> {
    (0..k).map(|i| (i + 1) as u8).collect()
}

/// Row `j`, column `i` of the parity generator: `alpha_i ^ j`.
fn generator_entry(alphas: &[u8], row: usize, col: usize) -> u8 {
    gf::pow(tables(), alphas[col], row)
}

// ─── Encoder ─────────────────────────────────────────────────────────────────

pub struct FecEncoder {
    k: usize,
    m: usize,
    alphas: Vec<u8>,
}

impl FecEncoder {
    pub fn new(k: usize, m: usize) -> Result<Self, FecError> {
        if k == 0 || m == 0 || k + m > 255 {
            return Err(FecError::InvalidShape);
        }
        Ok(FecEncoder {
            k,
            m,
            alphas: eval_points(k),
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn m(&self) -> usize {
        self.m
    }

    /// Generate `m` parity shards from exactly `k` data shards. Shorter
    /// shards are treated as zero-padded to the longest shard's length.
    pub fn encode(&self, shards: &[Bytes]) -> Result<Vec<Bytes>, FecError> {
        if shards.len() != self.k {
            return Err(FecError::WrongShardCount);
        }
        let max_len = shards.iter().map(|s| s.len()).max().unwrap_or(0);
        let t = tables();

        let mut parity = vec![vec![0u8; max_len]; self.m];
        for (row, parity_row) in parity.iter_mut().enumerate() {
            for (col, shard) in shards.iter().enumerate() {
                let coeff = generator_entry(&self.alphas, row, col);
                if coeff == 0 {
                    continue;
                }
                for (byte_idx, &byte) in shard.iter().enumerate() {
                    parity_row[byte_idx] ^= gf::mul(t, coeff, byte);
                }
            }
        }
        Ok(parity.into_iter().map(Bytes::from).collect())
    }
}

// ─── Decoder ─────────────────────────────────────────────────────────────────

pub struct FecDecoder {
    k: usize,
    m: usize,
    alphas: Vec<u8>,
}

impl FecDecoder {
    pub fn new(k: usize, m: usize) -> Result<Self, FecError> {
        if k == 0 || m == 0 || k + m > 255 {
            return Err(FecError::InvalidShape);
        }
        Ok(FecDecoder {
            k,
            m,
            alphas: eval_points(k),
        })
    }

    /// Row of the full `(k+m) x k` generator for shard index `shard_idx`
    /// (data shards `0..k` are identity rows, parity shards `k..k+m` use
    /// the Vandermonde rows).
    fn generator_row(&self, shard_idx: usize) -> Vec<u8> {
        if shard_idx < self.k {
            let mut row = vec![0u8; self.k];
            row[shard_idx] = 1;
            row
        } else {
            let parity_row = shard_idx - self.k;
            (0..self.k)
                .map(|col| generator_entry(&self.alphas, parity_row, col))
                .collect()
        }
    }

    /// Recover the `k` data shards given `k + m` shard slots, some `None`
    /// (erased). Returns [`FecError::Unrecoverable`] if more than `m`
    /// shards are missing. If no data shards are missing, returns them
    /// directly without running the linear algebra.
    pub fn decode(&self, shards: &[Option<Bytes>]) -> Result<Vec<Bytes>, FecError> {
        if shards.len() != self.k + self.m {
            return Err(FecError::WrongShardCount);
        }

        let missing = shards.iter().filter(|s| s.is_none()).count();
        if missing > self.m {
            return Err(FecError::Unrecoverable);
        }
        if shards[..self.k].iter().all(|s| s.is_some()) {
            return Ok(shards[..self.k]
                .iter()
                .map(|s| s.clone().unwrap())
                .collect());
        }

        let survivors: Vec<usize> = (0..self.k + self.m)
            .filter(|&i| shards[i].is_some())
            .take(self.k)
            .collect();
        debug_assert_eq!(survivors.len(), self.k);

        let shard_len = shards
            .iter()
            .find_map(|s| s.as_ref().map(|b| b.len()))
            .unwrap_or(0);

        let matrix: Vec<Vec<u8>> = survivors.iter().map(|&i| self.generator_row(i)).collect();
        let inverse = invert_matrix(&matrix).ok_or(FecError::Unrecoverable)?;

        let t = tables();
        let mut data = vec![vec![0u8; shard_len]; self.k];
        for (out_row, inv_row) in inverse.iter().enumerate() {
            for (col, &survivor_idx) in survivors.iter().enumerate() {
                let coeff = inv_row[col];
                if coeff == 0 {
                    continue;
                }
                let shard = shards[survivor_idx].as_ref().unwrap();
                for (byte_idx, &byte) in shard.iter().enumerate() {
                    data[out_row][byte_idx] ^= gf::mul(t, coeff, byte);
                }
            }
        }
        Ok(data.into_iter().map(Bytes::from).collect())
    }
}

/// Gauss-Jordan inversion over GF(2^8). Returns `None` if the matrix is
/// singular — should not happen for distinct evaluation points, but the
/// erasure pattern is caller-controlled so this fails closed rather than
/// panicking.
fn invert_matrix(matrix: &[Vec<u8>]) -> Option<Vec<Vec<u8>>> {
    let n = matrix.len();
    let t = tables();
    let mut aug: Vec<Vec<u8>> = matrix
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut r = row.clone();
            r.resize(2 * n, 0);
            r[n + i] = 1;
            r
        })
        .collect();

    for col in 0..n {
        let pivot_row = (col..n).find(|&r| aug[r][col] != 0)?;
        aug.swap(col, pivot_row);

        let pivot_inv = gf::inv(t, aug[col][col]);
        for v in aug[col].iter_mut() {
            *v = gf::mul(t, *v, pivot_inv);
        }

        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = aug[r][col];
            if factor == 0 {
                continue;
            }
            for c in 0..2 * n {
                aug[r][c] ^= gf::mul(t, factor, aug[col][c]);
            }
        }
    }

    Some(aug.into_iter().map(|row| row[n..].to_vec()).collect())
}
