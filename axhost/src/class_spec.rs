// SPDX-License-Identifier: GPL-3.0-or-later

//! Class registration requests.
//!
//! A [`ClassSpec`] is parsed from `clsid[/alias[/clsctx_create[/clsctx_register[/regcls]]]]`.
//! Every field after the CLSID is optional, an empty field keeps the default.
//! Numbers are decimal or `0x` prefixed hexadecimal.

use std::fmt;

use windows::Win32::{
    Foundation::{CO_E_CLASSSTRING, S_OK},
    System::Com::{
        CLSCTX_INPROC_SERVER, CLSCTX_LOCAL_SERVER, CLSIDFromProgID, REGCLS_MULTI_SEPARATE,
        REGCLS_MULTIPLEUSE, REGCLS_SINGLEUSE, REGCLS_SURROGATE, REGCLS_SUSPENDED,
    },
};
use windows_core::{Error, GUID, HRESULT, HSTRING, Result};

use crate::{guid::parse_guid, notify};

pub const CONTEXT_INPROC_SERVER: u32 = CLSCTX_INPROC_SERVER.0 as u32;
pub const CONTEXT_LOCAL_SERVER: u32 = CLSCTX_LOCAL_SERVER.0 as u32;

pub const REGISTER_SINGLE_USE: u32 = REGCLS_SINGLEUSE.0 as u32;
pub const REGISTER_MULTIPLE_USE: u32 = REGCLS_MULTIPLEUSE.0 as u32;
pub const REGISTER_MULTI_SEPARATE: u32 = REGCLS_MULTI_SEPARATE.0 as u32;
pub const REGISTER_SUSPENDED: u32 = REGCLS_SUSPENDED.0 as u32;
pub const REGISTER_SURROGATE: u32 = REGCLS_SURROGATE.0 as u32;

#[derive(Clone, Debug, PartialEq)]
pub struct ClassSpec {
    pub clsid: GUID,
    pub alias: GUID,
    pub clsid_input: String,
    pub alias_input: String,
    pub clsctx_create: u32,
    pub clsctx_register: u32,
    pub regcls: u32,
    pub regcls_explicit: bool,
    pub result: HRESULT,
    pub error: String,
}

impl ClassSpec {
    pub fn new(clsid: GUID) -> ClassSpec {
        ClassSpec {
            clsid,
            alias: GUID::zeroed(),
            clsid_input: String::new(),
            alias_input: String::new(),
            clsctx_create: 0,
            clsctx_register: 0,
            regcls: 0,
            regcls_explicit: false,
            result: S_OK,
            error: String::new(),
        }
    }

    /// A CLSID or alias that cannot be resolved is reported and left null so
    /// registration can reject it later; the remaining fields still parse.
    pub fn parse(item: &str) -> ClassSpec {
        let mut spec = ClassSpec::new(GUID::zeroed());
        let mut fields = item.split('/').map(str::trim);

        if let Some(field) = fields.next().filter(|field| !field.is_empty()) {
            spec.clsid_input = field.to_owned();
            match resolve_clsid(field) {
                Ok(clsid) => spec.clsid = clsid,
                Err(error) => spec.record_parse_error("CLSID", field, &error),
            }
        }
        if let Some(field) = fields.next().filter(|field| !field.is_empty()) {
            spec.alias_input = field.to_owned();
            match resolve_clsid(field) {
                Ok(alias) => spec.alias = alias,
                Err(error) => spec.record_parse_error("alias", field, &error),
            }
        }
        if let Some(value) = fields.next().and_then(parse_number) {
            spec.clsctx_create = value;
        }
        if let Some(value) = fields.next().and_then(parse_number) {
            spec.clsctx_register = value;
        }
        if let Some(value) = fields.next().and_then(parse_number) {
            spec.regcls = value;
            spec.regcls_explicit = true;
        }
        spec
    }

    /// Fills every unset field. An explicit `regcls` is used exactly as given.
    pub fn sanitize(&mut self, default_regcls: u32) {
        if self.alias == GUID::zeroed() {
            self.alias = self.clsid;
        }
        if self.alias_input.is_empty() {
            self.alias_input = self.clsid_input.clone();
        }
        if self.clsctx_create == 0 {
            self.clsctx_create = CONTEXT_INPROC_SERVER;
        }
        if self.clsctx_register == 0 {
            self.clsctx_register = CONTEXT_LOCAL_SERVER;
        }
        if !self.regcls_explicit {
            self.regcls = if default_regcls == 0 {
                REGISTER_SINGLE_USE | REGISTER_MULTI_SEPARATE
            } else {
                default_regcls
            };
        }
    }

    pub fn has_clsid(&self) -> bool {
        self.clsid != GUID::zeroed()
    }

    pub fn is_multiple_use(&self) -> bool {
        self.regcls & REGISTER_MULTIPLE_USE != 0
    }

    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub(crate) fn record_error(&mut self, error: &Error) {
        self.result = error.code();
        self.error = notify::describe(error);
    }

    fn record_parse_error(&mut self, what: &str, field: &str, error: &Error) {
        self.record_error(error);
        notify::warning(
            "Invalid Class Specification",
            &format!("Could not resolve {what} \"{field}\": {}", self.error),
        );
    }
}

impl fmt::Display for ClassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/0x{:X}/0x{:X}/0x{:X}",
            self.clsid_input, self.alias_input, self.clsctx_create, self.clsctx_register, self.regcls
        )
    }
}

pub fn any_multiple_use(specs: &[ClassSpec], default_regcls: u32) -> bool {
    default_regcls & REGISTER_MULTIPLE_USE != 0
        || specs
            .iter()
            .any(|spec| spec.regcls_explicit && spec.is_multiple_use())
}

/// Accepts a registry-form GUID or a ProgID.
fn resolve_clsid(text: &str) -> Result<GUID> {
    if let Some(guid) = parse_guid(text) {
        return Ok(guid);
    }
    if text.starts_with('{') {
        return Err(CO_E_CLASSSTRING.into());
    }
    unsafe { CLSIDFromProgID(&HSTRING::from(text)) }
}

pub(crate) fn parse_number(text: &str) -> Option<u32> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
