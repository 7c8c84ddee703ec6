// Copyright 2026 Rowferry Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::time::Duration;

use mysql_async::Value;

use crate::error::{FerryError, Result};

/// Bounds a database operation by the configured deadline. Expiry surfaces
/// as a retryable transport error.
pub(crate) async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(FerryError::Deadline(deadline)),
    }
}

/// Reads an unsigned integer primary key out of a wire value.
pub(crate) fn pk_value(value: &Value) -> Result<u64> {
    match value {
        Value::UInt(pk) => Ok(*pk),
        Value::Int(pk) if *pk >= 0 => Ok(*pk as u64),
        other => Err(FerryError::invariant(format!(
            "primary key is not an unsigned integer: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn pk_value_accepts_unsigned_and_nonnegative() {
        assert_eq!(pk_value(&Value::UInt(7)).unwrap(), 7);
        assert_eq!(pk_value(&Value::Int(7)).unwrap(), 7);
        assert_matches!(pk_value(&Value::Int(-1)), Err(FerryError::Invariant(_)));
        assert_matches!(
            pk_value(&Value::Bytes(b"7".to_vec())),
            Err(FerryError::Invariant(_))
        );
    }

    #[tokio::test]
    async fn deadline_expiry_is_a_deadline_error() {
        let deadline = Duration::from_millis(5);
        let result: Result<()> = with_deadline(deadline, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_matches!(result, Err(FerryError::Deadline(d)) if d == deadline);
    }
}
