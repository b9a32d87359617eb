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

//! Exponential backoff shared by the broker adapter's reconnect loop (§4.2:
//! 5 attempts, initial delay 2s, doubling) and the worker's registration
//! retries (§5: registration POST, 10s timeout, 5 retries).

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub const fn new(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
        }
    }

    /// Broker reconnect policy: attempts 5, initial delay 2s, doubling.
    pub const fn broker_reconnect() -> Self {
        Self::new(5, Duration::from_secs(2), 2.0)
    }

    /// Worker registration policy: 5 retries, initial delay 2s, doubling.
    pub const fn registration() -> Self {
        Self::new(5, Duration::from_secs(2), 2.0)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        self.initial_delay.mul_f64(factor)
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between attempts. Returns the last error if every attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: BackoffPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_each_attempt() {
        let policy = BackoffPolicy::broker_reconnect();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = BackoffPolicy::new(5, Duration::from_millis(1), 1.0);
        let mut calls = 0;
        let result: Result<u32, &str> = retry_with_backoff(policy, || {
            calls += 1;
            let calls = calls;
            async move {
                if calls < 3 {
                    Err("not yet")
                } else {
                    Ok(calls)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = BackoffPolicy::new(3, Duration::from_millis(1), 1.0);
        let result: Result<u32, &str> =
            retry_with_backoff(policy, || async { Err("always fails") }).await;
        assert_eq!(result, Err("always fails"));
    }
}
