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

/// A `Display`-like trait for values that may contain secrets: config structs
/// and service errors implement this instead of (or in addition to) `Display`
/// so that logs and startup banners never leak credentials.
pub trait SafeDisplay {
    fn to_safe_string(&self) -> String;

    /// Same as `to_safe_string`, indented by two spaces on every line — used
    /// when nesting one config section's safe string inside another's.
    fn to_safe_string_indented(&self) -> String {
        self.to_safe_string()
            .lines()
            .map(|line| format!("  {line}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl SafeDisplay for String {
    fn to_safe_string(&self) -> String {
        self.clone()
    }
}
