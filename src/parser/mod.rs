// Copyright 2022 Ryan Seipp
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

//! Request-line, header, method, version, and status parsing.

pub mod method;
pub mod request;
pub mod status;
pub mod version;

pub use method::Method;
pub use request::{parse_request_line, HeaderScanner, HeaderStep, RequestLine};
pub use status::Status;
pub use version::Version;
