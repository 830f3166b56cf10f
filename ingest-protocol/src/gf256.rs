//! GF(2^8) arithmetic for the parity codec
//!
//! Field polynomial x^8 + x^4 + x^3 + x^2 + 1 (0x11D), generator 2. The
//! log/exp tables are built at compile time.

const POLYNOMIAL: u16 = 0x11D;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

const fn build_tables() -> Tables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= POLYNOMIAL;
        }
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    Tables { exp, log }
}

static TABLES: Tables = build_tables();

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    TABLES.exp[TABLES.log[a as usize] as usize + TABLES.log[b as usize] as usize]
}

/// Multiplicative inverse; zero has none and maps to zero
#[inline]
pub fn inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    TABLES.exp[255 - TABLES.log[a as usize] as usize]
}

#[inline]
pub fn div(a: u8, b: u8) -> u8 {
    mul(a, inv(b))
}

/// `dst ^= src * coeff`, element-wise
pub fn mul_add_slice(dst: &mut [u8], src: &[u8], coeff: u8) {
    match coeff {
        0 => {}
        1 => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= *s;
            }
        }
        _ => {
            let log_c = TABLES.log[coeff as usize] as usize;
            for (d, s) in dst.iter_mut().zip(src) {
                if *s != 0 {
                    *d ^= TABLES.exp[log_c + TABLES.log[*s as usize] as usize];
                }
            }
        }
    }
}

/// `data *= coeff`, element-wise
pub fn scale_slice(data: &mut [u8], coeff: u8) {
    if coeff == 1 {
        return;
    }
    for d in data.iter_mut() {
        *d = mul(*d, coeff);
    }
}

/// Cauchy matrix element for parity row `row` of a `k`-source block
///
/// Rows use x = k + row, columns y = col; x != y so the element exists and
/// every square submatrix is invertible.
#[inline]
pub fn cauchy(k: usize, row: usize, col: usize) -> u8 {
    inv(((k + row) as u8) ^ (col as u8))
}
