//! Kubernetes resource quantity parsing
//!
//! Handles the forms the metrics API emits: plain numbers (`2`, `0.5`),
//! decimal SI suffixes (`250000n`, `150m`, `12M`), binary suffixes
//! (`2048Ki`, `1Gi`) and exponent notation (`1e3`, `5E-3`).
//! Conversions round up, matching how Kubernetes reports milli values.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid quantity '{0}'")]
pub struct InvalidQuantity(pub String);

/// Exact value `digits * 10^dec_exp * 1024^bin_exp`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantity {
    digits: i128,
    dec_exp: i32,
    bin_exp: u32,
}

// Keeps every intermediate product inside i128
const MAX_DIGITS: usize = 30;

impl Quantity {
    pub fn parse(input: &str) -> Result<Self, InvalidQuantity> {
        let invalid = || InvalidQuantity(input.to_string());
        let s = input.trim();
        if s.is_empty() {
            return Err(invalid());
        }

        let (negative, body) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let number_len = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let (number, suffix) = body.split_at(number_len);

        let (int_part, frac_part) = match number.split_once('.') {
            Some((i, f)) => (i, f),
            None => (number, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if frac_part.contains('.') || int_part.len() + frac_part.len() > MAX_DIGITS {
            return Err(invalid());
        }

        let mut digits: i128 = 0;
        for c in int_part.chars().chain(frac_part.chars()) {
            digits = digits * 10 + i128::from(c as u8 - b'0');
        }
        if negative {
            digits = -digits;
        }
        let mut dec_exp = -(frac_part.len() as i32);

        let bin_exp = match suffix {
            "" => 0,
            "Ki" => 1,
            "Mi" => 2,
            "Gi" => 3,
            "Ti" => 4,
            "Pi" => 5,
            "Ei" => 6,
            _ => {
                dec_exp += Self::decimal_suffix(suffix).ok_or_else(invalid)?;
                0
            }
        };

        Ok(Self {
            digits,
            dec_exp,
            bin_exp,
        })
    }

    fn decimal_suffix(suffix: &str) -> Option<i32> {
        let exp = match suffix {
            "n" => -9,
            "u" => -6,
            "m" => -3,
            "k" => 3,
            "M" => 6,
            "G" => 9,
            "T" => 12,
            "P" => 15,
            "E" => 18,
            _ => {
                // Exponent form: e.g. "e3", "E-2"
                let rest = suffix.strip_prefix(['e', 'E'])?;
                if rest.is_empty() {
                    return None;
                }
                return rest.parse::<i32>().ok().filter(|e| e.abs() <= 64);
            }
        };
        Some(exp)
    }

    /// Value in base units, rounded up
    pub fn value(&self) -> i64 {
        self.scaled(0)
    }

    /// Value in thousandths of a base unit, rounded up
    pub fn milli_value(&self) -> i64 {
        self.scaled(3)
    }

    fn scaled(&self, extra_dec: i32) -> i64 {
        let mut n = self.digits;
        for _ in 0..self.bin_exp {
            n = match n.checked_mul(1024) {
                Some(v) => v,
                None => return saturate(n),
            };
        }

        let exp = self.dec_exp + extra_dec;
        if exp >= 0 {
            for _ in 0..exp {
                n = match n.checked_mul(10) {
                    Some(v) => v,
                    None => return saturate(n),
                };
            }
            return saturate(n);
        }

        let Some(divisor) = 10i128.checked_pow(exp.unsigned_abs()) else {
            return if n > 0 { 1 } else { 0 };
        };
        let quotient = n / divisor;
        if n > 0 && n % divisor != 0 {
            saturate(quotient + 1)
        } else {
            saturate(quotient)
        }
    }
}

fn saturate(n: i128) -> i64 {
    n.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

/// CPU quantity to millicores
pub fn cpu_millis(quantity: &str) -> Result<i64, InvalidQuantity> {
    Quantity::parse(quantity).map(|q| q.milli_value())
}

/// Memory quantity to bytes
pub fn memory_bytes(quantity: &str) -> Result<i64, InvalidQuantity> {
    Quantity::parse(quantity).map(|q| q.value())
}
