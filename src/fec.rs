//! Reed-Solomon RS(255,223) forward error correction over GF(2^8).
//!
//! Field generated by the primitive polynomial x^8 + x^4 + x^3 + x^2 + 1
//! (0x11D), the same field used by CCSDS and DVB. Systematic encoding adds
//! 32 parity bytes; decoding corrects up to 16 byte errors per codeword.
//! Shortened codewords (`data_len < 223`) are handled by omitting the
//! leading virtual zeros.
//!
//! The decoder runs syndromes, Berlekamp-Massey, Chien search and Forney,
//! then re-checks syndromes after correction: every inconsistent path
//! returns [`NadeError::Uncorrectable`], never a silently wrong codeword.

use crate::error::{NadeError, Result};
use once_cell::sync::Lazy;

/// Total codeword length (n).
pub const RS_BLOCK_SIZE: usize = 255;
/// Data bytes per codeword (k).
pub const RS_DATA_SIZE: usize = 223;
/// Parity bytes per codeword (n - k = 2t).
pub const RS_PARITY_SIZE: usize = 32;
/// Maximum correctable symbol errors per codeword (t).
pub const RS_CORRECTABLE: usize = 16;

const PRIMITIVE_POLY: u16 = 0x11D;

struct GfTables {
    /// Anti-log table, doubled so products of logs never need a mod.
    exp: [u8; 512],
    log: [u8; 256],
    /// Generator polynomial g(x) = (x - a^1)(x - a^2)...(x - a^32),
    /// coefficients in ascending power order, gen[32] = 1.
    gen: [u8; RS_PARITY_SIZE + 1],
}

static TABLES: Lazy<GfTables> = Lazy::new(|| {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    for i in 0..255 {
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

    let mut gen = [0u8; RS_PARITY_SIZE + 1];
    gen[0] = 1;
    for i in 0..RS_PARITY_SIZE {
        // Multiply the ascending-order polynomial by (x - a^(i+1)).
        let root = exp[i + 1];
        for j in (0..=i).rev() {
            gen[j + 1] ^= gen[j];
            gen[j] = mul_raw(&exp, &log, gen[j], root);
        }
    }
    GfTables { exp, log, gen }
});

fn mul_raw(exp: &[u8; 512], log: &[u8; 256], a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    exp[log[a as usize] as usize + log[b as usize] as usize]
}

fn gf_mul(a: u8, b: u8) -> u8 {
    mul_raw(&TABLES.exp, &TABLES.log, a, b)
}

fn gf_inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    TABLES.exp[255 - TABLES.log[a as usize] as usize]
}

/// Evaluate an ascending-order polynomial at a^exp_point.
fn poly_eval_at(poly: &[u8], exp_point: usize) -> u8 {
    let t = &*TABLES;
    let mut sum = poly[0];
    for (j, &coeff) in poly.iter().enumerate().skip(1) {
        if coeff != 0 {
            sum ^= t.exp[(t.log[coeff as usize] as usize + exp_point * j) % 255];
        }
    }
    sum
}

/// Number of bytes a codeword carries for `data_len` data bytes.
pub fn rs_encoded_len(data_len: usize) -> usize {
    data_len + RS_PARITY_SIZE
}

/// Number of data bytes inside a codeword of `encoded_len` bytes.
pub fn rs_data_len(encoded_len: usize) -> usize {
    encoded_len.saturating_sub(RS_PARITY_SIZE)
}

/// Systematically encode `data` (1..=223 bytes) into `data || parity[32]`.
pub fn rs_encode(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() > RS_DATA_SIZE {
        return Err(NadeError::BadArgument("rs data length"));
    }
    let t = &*TABLES;
    // Shift-register division of data(x) * x^32 by g(x); reg[i] holds the
    // coefficient of x^i of the running remainder.
    let mut reg = [0u8; RS_PARITY_SIZE];
    for &byte in data {
        let feedback = byte ^ reg[RS_PARITY_SIZE - 1];
        for i in (1..RS_PARITY_SIZE).rev() {
            reg[i] = reg[i - 1] ^ mul_raw(&t.exp, &t.log, feedback, t.gen[i]);
        }
        reg[0] = mul_raw(&t.exp, &t.log, feedback, t.gen[0]);
    }
    let mut out = Vec::with_capacity(rs_encoded_len(data.len()));
    out.extend_from_slice(data);
    // Parity bytes follow the data in descending power order.
    out.extend(reg.iter().rev());
    Ok(out)
}

/// Syndromes S_1..S_32: the codeword polynomial (first byte = highest
/// power, shortening implicit) evaluated at a^1..a^32.
fn syndromes(codeword: &[u8]) -> [u8; RS_PARITY_SIZE] {
    let t = &*TABLES;
    let mut out = [0u8; RS_PARITY_SIZE];
    for (i, slot) in out.iter_mut().enumerate() {
        let x = t.exp[i + 1];
        let mut acc = 0u8;
        for &byte in codeword {
            acc = mul_raw(&t.exp, &t.log, acc, x) ^ byte;
        }
        *slot = acc;
    }
    out
}

fn syndromes_zero(synd: &[u8; RS_PARITY_SIZE]) -> bool {
    synd.iter().all(|&s| s == 0)
}

/// Berlekamp-Massey: error locator sigma (ascending order) and its degree.
fn berlekamp_massey(synd: &[u8; RS_PARITY_SIZE]) -> ([u8; RS_PARITY_SIZE + 1], usize) {
    let mut c = [0u8; RS_PARITY_SIZE + 1];
    let mut b = [0u8; RS_PARITY_SIZE + 1];
    c[0] = 1;
    b[0] = 1;
    let mut l = 0usize;
    let mut m = 1usize;
    let mut last_d = 1u8;
    for n in 0..RS_PARITY_SIZE {
        let mut d = synd[n];
        for i in 1..=l {
            d ^= gf_mul(c[i], synd[n - i]);
        }
        if d == 0 {
            m += 1;
        } else if 2 * l <= n {
            let t = c;
            let coef = gf_mul(d, gf_inv(last_d));
            for i in 0..=RS_PARITY_SIZE.saturating_sub(m) {
                c[i + m] ^= gf_mul(coef, b[i]);
            }
            l = n + 1 - l;
            b = t;
            last_d = d;
            m = 1;
        } else {
            let coef = gf_mul(d, gf_inv(last_d));
            for i in 0..=RS_PARITY_SIZE.saturating_sub(m) {
                c[i + m] ^= gf_mul(coef, b[i]);
            }
            m += 1;
        }
    }
    (c, l)
}

/// Chien search over all positions of the (shortened) codeword. The byte at
/// position j carries the power n-1-j, so its locator inverse is
/// a^(255-(n-1-j)); a sigma root there marks an error at j.
fn chien_search(sigma: &[u8], degree: usize, n: usize) -> Vec<usize> {
    let t = &*TABLES;
    let mut positions = Vec::with_capacity(degree);
    for j in 0..n {
        let x_exp = (256 + j - n) % 255;
        let mut sum = sigma[0];
        for i in 1..=degree {
            if sigma[i] != 0 {
                sum ^= t.exp[(t.log[sigma[i] as usize] as usize + x_exp * i) % 255];
            }
        }
        if sum == 0 {
            positions.push(j);
            if positions.len() == degree {
                break;
            }
        }
    }
    positions
}

/// Forney: error magnitude at each located position from the evaluator
/// omega(x) = S(x)*sigma(x) mod x^32 and the formal derivative sigma'.
fn forney(
    synd: &[u8; RS_PARITY_SIZE],
    sigma: &[u8],
    degree: usize,
    positions: &[usize],
    n: usize,
) -> Vec<u8> {
    let mut omega = [0u8; RS_PARITY_SIZE];
    for i in 0..RS_PARITY_SIZE {
        for j in 0..=degree.min(i) {
            omega[i] ^= gf_mul(synd[i - j], sigma[j]);
        }
    }
    // Formal derivative: only odd powers survive in GF(2^m).
    let mut sigma_prime = [0u8; RS_PARITY_SIZE + 1];
    for i in (1..=degree).step_by(2) {
        sigma_prime[i - 1] = sigma[i];
    }
    positions
        .iter()
        .map(|&j| {
            let x_exp = (256 + j - n) % 255;
            let omega_val = poly_eval_at(&omega, x_exp);
            let sigma_prime_val = poly_eval_at(&sigma_prime[..degree.max(1)], x_exp);
            if sigma_prime_val == 0 {
                0
            } else {
                gf_mul(omega_val, gf_inv(sigma_prime_val))
            }
        })
        .collect()
}

/// Correct up to 16 byte errors in `codeword` in place.
/// Returns the number of errors corrected.
pub fn rs_decode(codeword: &mut [u8]) -> Result<usize> {
    if codeword.len() <= RS_PARITY_SIZE || codeword.len() > RS_BLOCK_SIZE {
        return Err(NadeError::BadArgument("rs codeword length"));
    }
    let synd = syndromes(codeword);
    if syndromes_zero(&synd) {
        return Ok(0);
    }
    let (sigma, degree) = berlekamp_massey(&synd);
    if degree > RS_CORRECTABLE {
        return Err(NadeError::Uncorrectable);
    }
    let positions = chien_search(&sigma, degree, codeword.len());
    if positions.len() != degree {
        return Err(NadeError::Uncorrectable);
    }
    let magnitudes = forney(&synd, &sigma, degree, &positions, codeword.len());
    for (&pos, &mag) in positions.iter().zip(&magnitudes) {
        codeword[pos] ^= mag;
    }
    if !syndromes_zero(&syndromes(codeword)) {
        return Err(NadeError::Uncorrectable);
    }
    Ok(degree)
}

/// Syndrome-only validity probe; true when the codeword is error-free.
pub fn rs_check(codeword: &[u8]) -> bool {
    if codeword.len() <= RS_PARITY_SIZE || codeword.len() > RS_BLOCK_SIZE {
        return false;
    }
    syndromes_zero(&syndromes(codeword))
}
