// SPDX-License-Identifier: GPL-3.0-or-later

//! `IProvideClassInfo2` for hosted controls.
//!
//! The control's own answer wins. Controls that do not provide class info
//! get it from their registered type library.

use windows::Win32::{
    Foundation::{E_INVALIDARG, TYPE_E_ELEMENTNOTFOUND, TYPE_E_LIBNOTREGISTERED},
    System::{
        Com::{IMPLTYPEFLAG_FDEFAULT, IMPLTYPEFLAG_FSOURCE, ITypeInfo},
        Ole::{
            GUIDKIND_DEFAULT_SOURCE_DISP_IID, IProvideClassInfo, IProvideClassInfo_Impl,
            IProvideClassInfo2, IProvideClassInfo2_Impl, LoadRegTypeLib,
        },
    },
};
use windows_core::{GUID, Result, implement};
use windows_registry::CLASSES_ROOT;

use crate::guid::{format_guid, parse_guid};

pub const DEFAULT_SOURCE_DISP_IID: u32 = GUIDKIND_DEFAULT_SOURCE_DISP_IID.0 as u32;

const LOCALE_USER_DEFAULT: u32 = 0x400;

#[implement(IProvideClassInfo2)]
pub struct HostProvideClassInfo {
    clsid: GUID,
    underlying: Option<IProvideClassInfo>,
    underlying2: Option<IProvideClassInfo2>,
}

impl HostProvideClassInfo {
    pub fn new(
        clsid: GUID,
        underlying: Option<IProvideClassInfo>,
        underlying2: Option<IProvideClassInfo2>,
    ) -> HostProvideClassInfo {
        HostProvideClassInfo {
            clsid,
            underlying,
            underlying2,
        }
    }

    fn class_info(&self) -> Result<ITypeInfo> {
        if let Some(underlying) = &self.underlying {
            match unsafe { underlying.GetClassInfo() } {
                Ok(info) => return Ok(info),
                Err(error) => log::debug!("control has no class info of its own: {error}"),
            }
        }
        registered_class_info(&self.clsid)
    }
}

impl IProvideClassInfo_Impl for HostProvideClassInfo_Impl {
    fn GetClassInfo(&self) -> Result<ITypeInfo> {
        self.class_info()
    }
}

impl IProvideClassInfo2_Impl for HostProvideClassInfo_Impl {
    fn GetGUID(&self, dwguidkind: u32) -> Result<GUID> {
        if let Some(underlying) = &self.underlying2 {
            if let Ok(guid) = unsafe { underlying.GetGUID(dwguidkind) } {
                return Ok(guid);
            }
        }
        if dwguidkind != DEFAULT_SOURCE_DISP_IID {
            return Err(E_INVALIDARG.into());
        }
        default_source_iid(&self.class_info()?)
    }
}

pub fn registered_class_info(clsid: &GUID) -> Result<ITypeInfo> {
    let key = CLASSES_ROOT.open(format!(r"CLSID\{}\TypeLib", format_guid(clsid)))?;
    let libid = key.get_string("")?;
    let libid = parse_guid(&libid).ok_or(TYPE_E_LIBNOTREGISTERED)?;

    let versions = CLASSES_ROOT
        .open(format!(r"TypeLib\{}", format_guid(&libid)))
        .map_err(|_| TYPE_E_LIBNOTREGISTERED)?;
    let names = versions.keys()?;
    let (major, minor) = latest_version(names).ok_or(TYPE_E_LIBNOTREGISTERED)?;
    log::debug!("loading type library {} {major}.{minor}", format_guid(&libid));

    let library = unsafe { LoadRegTypeLib(&libid, major, minor, LOCALE_USER_DEFAULT) }?;
    unsafe { library.GetTypeInfoOfGuid(clsid) }
}

/// Picks the highest `major.minor` among type library version key names.
///
/// Both parts are hexadecimal, the way `regtlib` writes them. Names that do
/// not parse are skipped, and `0.0` counts as unregistered.
pub fn latest_version<I, S>(names: I) -> Option<(u16, u16)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter_map(|name| {
            let (major, minor) = name.as_ref().split_once('.')?;
            let major = u16::from_str_radix(major.trim(), 16).ok()?;
            let minor = u16::from_str_radix(minor.trim(), 16).ok()?;
            Some((major, minor))
        })
        .max()
        .filter(|&version| version != (0, 0))
}

pub fn default_source_iid(coclass: &ITypeInfo) -> Result<GUID> {
    for index in 0.. {
        let Ok(flags) = (unsafe { coclass.GetImplTypeFlags(index) }) else {
            break;
        };
        if flags.0 & IMPLTYPEFLAG_FDEFAULT.0 == 0 || flags.0 & IMPLTYPEFLAG_FSOURCE.0 == 0 {
            continue;
        }
        let Ok(reference) = (unsafe { coclass.GetRefTypeOfImplType(index) }) else {
            continue;
        };
        let Ok(info) = (unsafe { coclass.GetRefTypeInfo(reference) }) else {
            continue;
        };
        let Ok(attr) = (unsafe { info.GetTypeAttr() }) else {
            continue;
        };
        if attr.is_null() {
            continue;
        }
        let guid = unsafe { (*attr).guid };
        unsafe { info.ReleaseTypeAttr(attr) };
        return Ok(guid);
    }
    Err(TYPE_E_ELEMENTNOTFOUND.into())
}
