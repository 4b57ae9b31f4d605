// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON validation of handler results.

use serde::Serialize;

use crate::outcome::Diagnostic;

/// Check that `value` serializes to JSON within `max_bytes`.
///
/// Returns the serialized size on success.
pub fn validate_result<T: Serialize + ?Sized>(value: &T, max_bytes: usize) -> Result<usize, Diagnostic> {
    let json = serde_json::to_vec(value).map_err(|e| Diagnostic::NotSerializable {
        message: e.to_string(),
    })?;

    if json.len() > max_bytes {
        return Err(Diagnostic::ResponseTooLarge {
            size: json.len(),
            limit: max_bytes,
        });
    }

    Ok(json.len())
}
