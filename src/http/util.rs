// Copyright 2024 Robin Dahl
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

//! Small HTTP helpers: URL codec, status text, MIME lookup, path checks.

use phf::phf_map;

static STATUS_TEXT: phf::Map<u16, &'static str> = phf_map! {
    100u16 => "Continue",
    101u16 => "Switching Protocol",
    200u16 => "OK",
    201u16 => "Created",
    202u16 => "Accepted",
    204u16 => "No Content",
    206u16 => "Partial Content",
    301u16 => "Moved Permanently",
    302u16 => "Found",
    303u16 => "See Other",
    304u16 => "Not Modified",
    307u16 => "Temporary Redirect",
    308u16 => "Permanent Redirect",
    400u16 => "Bad Request",
    401u16 => "Unauthorized",
    403u16 => "Forbidden",
    404u16 => "Not Found",
    405u16 => "Method Not Allowed",
    408u16 => "Request Timeout",
    411u16 => "Length Required",
    413u16 => "Payload Too Large",
    414u16 => "URI Too Long",
    415u16 => "Unsupported Media Type",
    426u16 => "Upgrade Required",
    429u16 => "Too Many Requests",
    431u16 => "Request Header Fields Too Large",
    500u16 => "Internal Server Error",
    501u16 => "Not Implemented",
    502u16 => "Bad Gateway",
    503u16 => "Service Unavailable",
    504u16 => "Gateway Timeout",
    505u16 => "HTTP Version Not Supported",
};

static MIME_TYPES: phf::Map<&'static str, &'static str> = phf_map! {
    "bin" => "application/octet-stream",
    "bmp" => "image/bmp",
    "css" => "text/css",
    "csv" => "text/csv",
    "gif" => "image/gif",
    "htm" => "text/html",
    "html" => "text/html",
    "ico" => "image/vnd.microsoft.icon",
    "jpeg" => "image/jpeg",
    "jpg" => "image/jpeg",
    "js" => "text/javascript",
    "json" => "application/json",
    "mp3" => "audio/mpeg",
    "mpeg" => "video/mpeg",
    "pdf" => "application/pdf",
    "png" => "image/png",
    "svg" => "image/svg+xml",
    "tar" => "application/x-tar",
    "txt" => "text/plain",
    "wav" => "audio/wav",
    "webm" => "video/webm",
    "webp" => "image/webp",
    "xml" => "application/xml",
    "zip" => "application/zip",
};

/// Reason phrase for a status code.
pub fn status_text(code: u16) -> &'static str {
    STATUS_TEXT.get(&code).copied().unwrap_or("Unknown")
}

/// Content type for a file path, by extension.
pub fn mime_for_path(path: &str) -> &'static str {
    path.rsplit_once('.')
        .and_then(|(_, ext)| MIME_TYPES.get(ext).copied())
        .unwrap_or("application/octet-stream")
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|v| v as u8)
}

/// Percent-decodes `input`. `plus_as_space` additionally turns `+` into a
/// space (form bodies); request paths keep `+` verbatim.
pub fn url_decode(input: &str, plus_as_space: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' if plus_as_space => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi * 16 + lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Percent-encodes everything outside the unreserved set.
pub fn url_encode(input: &str, space_as_plus: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'.' | b'-' | b'_' | b'~' => out.push(byte as char),
            b if b.is_ascii_alphanumeric() => out.push(b as char),
            b' ' if space_as_plus => out.push('+'),
            b => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Rejects paths whose `..` segments would escape the static root.
pub fn is_valid_path(path: &str) -> bool {
    let mut depth: i32 = 0;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == ".." {
            depth -= 1;
            if depth < 0 {
                return false;
            }
        } else {
            depth += 1;
        }
    }
    true
}
