// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Ascending identifier generation. Identifiers are lexicographically
//! sortable and strictly increasing within a process, which the sub-agent
//! relies on to order a reply loop: a user message id must always compare
//! greater than the most recent assistant message id it replied to.

use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::BridgeError;

const SUFFIX_LEN: usize = 14;
const BASE62_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn prefix_short(prefix: &str) -> Result<&'static str, BridgeError> {
    match prefix {
        "session" => Ok("ses"),
        "message" => Ok("msg"),
        "part" => Ok("prt"),
        other => Err(BridgeError::UnknownPrefix(other.to_string())),
    }
}

/// Holds the process-wide monotone counter. Single-threaded cooperative use
/// only; a concurrent embedding would need a mutex or compare-and-swap loop
/// around `next`.
#[derive(Debug, Default)]
pub struct AscendingIdGenerator {
    last_millis: u64,
    counter: u16,
}

impl AscendingIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, prefix: &str) -> Result<String, BridgeError> {
        let short = prefix_short(prefix)?;
        let millis = now_millis();
        if millis != self.last_millis {
            self.last_millis = millis;
            self.counter = 0;
        }
        self.counter = self.counter.wrapping_add(1);

        let encoded = (millis.wrapping_mul(0x1000)).wrapping_add(self.counter as u64) & 0xFFFF_FFFF_FFFF;
        let time_field = format!("{encoded:012x}");
        let suffix = random_base62(SUFFIX_LEN);
        Ok(format!("{short}_{time_field}{suffix}"))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

fn random_base62(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| BASE62_ALPHABET[(*b as usize) % BASE62_ALPHABET.len()] as char)
        .collect()
}
