/*
 * Copyright (C) 2025 The Bindery Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// A storage quantity in its wire form (`"10Gi"`, `"500M"`, `"1073741824"`).
///
/// The string is kept verbatim so objects round-trip unchanged; the numeric
/// value is computed on demand. Parsing failures surface where the value is
/// actually needed rather than at decode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(String);

impl Quantity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the quantity in bytes.
    pub fn value(&self) -> Result<i64, QuantityError> {
        let raw = self.0.trim();
        if raw.is_empty() {
            return Err(QuantityError::new(&self.0));
        }

        let split = raw
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(raw.len());
        let (number, suffix) = raw.split_at(split);
        let base: f64 = number.parse().map_err(|_| QuantityError::new(&self.0))?;
        let multiplier: f64 = match suffix {
            "" => 1.0,
            "k" => 1e3,
            "M" => 1e6,
            "G" => 1e9,
            "T" => 1e12,
            "Ki" => 1024.0,
            "Mi" => 1024.0 * 1024.0,
            "Gi" => 1024.0 * 1024.0 * 1024.0,
            "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
            _ => return Err(QuantityError::new(&self.0)),
        };

        let bytes = base * multiplier;
        if !bytes.is_finite() || bytes < 0.0 || bytes > i64::MAX as f64 {
            return Err(QuantityError::new(&self.0));
        }
        Ok(bytes.round() as i64)
    }
}

impl Default for Quantity {
    fn default() -> Self {
        Self("0".to_string())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Quantity {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Debug)]
pub struct QuantityError {
    raw: String,
}

impl QuantityError {
    fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
        }
    }
}

impl fmt::Display for QuantityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid quantity '{}'", self.raw)
    }
}

impl Error for QuantityError {}
