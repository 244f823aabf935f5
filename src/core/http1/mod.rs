/*
 * Copyright (C) 2024 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod cookie;
pub mod multipart;
pub mod params;
pub mod protocol;
pub mod request;
pub mod response;
pub mod util;

pub use self::cookie::CookieOptions;
pub use self::params::{ParamKey, ParamMap, ParamValue};
pub use self::protocol::{Error, ParseLimits, ParseOutcome, RequestParser};
pub use self::request::{Headers, Method, Request};
pub use self::response::{Response, ResponseError};
