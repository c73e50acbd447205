// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection point container proxy.
//!
//! Hands out one [`HostConnectionPoint`] per underlying connection point,
//! keyed by the point's `IUnknown` identity, no matter whether it was
//! reached through `FindConnectionPoint` or an enumeration.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use windows::Win32::{
    Foundation::{E_POINTER, E_UNEXPECTED},
    System::Com::{
        IConnectionPoint, IConnectionPointContainer, IConnectionPointContainer_Impl,
        IEnumConnectionPoints, IEnumConnectionPoints_Impl,
    },
};
use windows_core::{GUID, HRESULT, IUnknown, Interface, Result, Weak, implement};

use crate::connection_point::{HostConnectionPoint, enumeration_result};

#[derive(Default)]
struct ProxyCache {
    container: Mutex<Option<Weak<IConnectionPointContainer>>>,
    proxies: Mutex<HashMap<usize, IConnectionPoint>>,
}

impl ProxyCache {
    fn set_container(&self, container: Weak<IConnectionPointContainer>) {
        *self.container.lock().unwrap_or_else(PoisonError::into_inner) = Some(container);
    }

    fn proxy_for(&self, point: &IConnectionPoint) -> Result<IConnectionPoint> {
        let identity: IUnknown = point.cast()?;
        let key = identity.as_raw() as usize;
        let mut proxies = self.proxies.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(proxy) = proxies.get(&key) {
            return Ok(proxy.clone());
        }
        let container = self
            .container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let proxy = HostConnectionPoint::create(point.clone(), container);
        // The proxy keeps `point` alive, so its address cannot be reused
        // while the entry exists.
        proxies.insert(key, proxy.clone());
        Ok(proxy)
    }
}

#[implement(IConnectionPointContainer)]
pub struct HostConnectionPointContainer {
    underlying: Option<IConnectionPointContainer>,
    cache: Arc<ProxyCache>,
}

impl HostConnectionPointContainer {
    pub fn create(underlying: Option<IConnectionPointContainer>) -> IConnectionPointContainer {
        let cache = Arc::new(ProxyCache::default());
        let container: IConnectionPointContainer = HostConnectionPointContainer {
            underlying,
            cache: cache.clone(),
        }
        .into();
        match container.downgrade() {
            Ok(weak) => cache.set_container(weak),
            Err(error) => log::warn!("connection points cannot refer back to their container: {error}"),
        }
        container
    }

    fn underlying(&self) -> Result<&IConnectionPointContainer> {
        self.underlying.as_ref().ok_or_else(|| E_UNEXPECTED.into())
    }
}

impl IConnectionPointContainer_Impl for HostConnectionPointContainer_Impl {
    fn EnumConnectionPoints(&self) -> Result<IEnumConnectionPoints> {
        let underlying = unsafe { self.underlying()?.EnumConnectionPoints() }?;
        Ok(HostEnumConnectionPoints {
            underlying,
            cache: self.cache.clone(),
        }
        .into())
    }

    fn FindConnectionPoint(&self, riid: *const GUID) -> Result<IConnectionPoint> {
        if riid.is_null() {
            return Err(E_POINTER.into());
        }
        let point = unsafe { self.underlying()?.FindConnectionPoint(riid) }?;
        self.cache.proxy_for(&point)
    }
}

#[implement(IEnumConnectionPoints)]
struct HostEnumConnectionPoints {
    underlying: IEnumConnectionPoints,
    cache: Arc<ProxyCache>,
}

impl IEnumConnectionPoints_Impl for HostEnumConnectionPoints_Impl {
    fn Next(
        &self,
        cconnections: u32,
        ppcp: *mut Option<IConnectionPoint>,
        pcfetched: *mut u32,
    ) -> HRESULT {
        if ppcp.is_null() || (cconnections > 1 && pcfetched.is_null()) {
            return E_POINTER;
        }
        let mut fetched = 0;
        let hr = unsafe {
            (Interface::vtable(&self.underlying).Next)(
                Interface::as_raw(&self.underlying),
                cconnections,
                ppcp.cast(),
                &mut fetched,
            )
        };
        if hr.is_err() {
            return hr;
        }
        for index in 0..fetched.min(cconnections) as usize {
            let slot = unsafe { &mut *ppcp.add(index) };
            if let Some(point) = slot.take() {
                *slot = match self.cache.proxy_for(&point) {
                    Ok(proxy) => Some(proxy),
                    Err(error) => {
                        log::warn!("unable to wrap connection point: {error}");
                        Some(point)
                    }
                };
            }
        }
        if !pcfetched.is_null() {
            unsafe { pcfetched.write(fetched) };
        }
        hr
    }

    fn Skip(&self, cconnections: u32) -> Result<()> {
        let hr = unsafe {
            (Interface::vtable(&self.underlying).Skip)(
                Interface::as_raw(&self.underlying),
                cconnections,
            )
        };
        enumeration_result(hr)
    }

    fn Reset(&self) -> Result<()> {
        unsafe { self.underlying.Reset() }
    }

    fn Clone(&self) -> Result<IEnumConnectionPoints> {
        let underlying = unsafe { self.underlying.Clone() }?;
        Ok(HostEnumConnectionPoints {
            underlying,
            cache: self.cache.clone(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use windows::Win32::{
        Foundation::E_UNEXPECTED,
        System::Com::{COINIT_MULTITHREADED, IConnectionPoint, IConnectionPointContainer},
    };
    use windows_core::GUID;

    use super::HostConnectionPointContainer;
    use crate::{
        com_init::ComInitializeContext,
        test_support::{
            FakeConnectionPoint, FakeConnectionPointContainer, RecordingSink, identity,
            next_connections, next_points,
        },
    };

    const CLICKS: GUID = GUID::from_u128(0x11111111_2222_3333_4444_555555555555);
    const KEYS: GUID = GUID::from_u128(0x66666666_7777_8888_9999_AAAAAAAAAAAA);

    fn container() -> (IConnectionPoint, IConnectionPoint, IConnectionPointContainer) {
        let clicks = FakeConnectionPoint::create(CLICKS);
        let keys = FakeConnectionPoint::create(KEYS);
        let underlying = FakeConnectionPointContainer::create(vec![clicks.clone(), keys.clone()]);
        (clicks, keys, HostConnectionPointContainer::create(Some(underlying)))
    }

    #[test]
    fn find_returns_same_proxy_identity() {
        let (clicks, _, container) = container();
        let first = unsafe { container.FindConnectionPoint(&CLICKS) }.unwrap();
        let second = unsafe { container.FindConnectionPoint(&CLICKS) }.unwrap();
        assert_eq!(identity(&first), identity(&second));
        assert_ne!(identity(&clicks), identity(&first));
        assert_eq!(CLICKS, unsafe { first.GetConnectionInterface() }.unwrap());
    }

    #[test]
    fn enumeration_matches_find() {
        let (_, _, container) = container();
        let found = unsafe { container.FindConnectionPoint(&KEYS) }.unwrap();

        let once = next_points(&unsafe { container.EnumConnectionPoints() }.unwrap(), 2).1;
        let twice = next_points(&unsafe { container.EnumConnectionPoints() }.unwrap(), 2).1;
        assert_eq!(2, once.len());
        assert_eq!(identity(&once[0]), identity(&twice[0]));
        assert_eq!(identity(&once[1]), identity(&twice[1]));
        assert_eq!(identity(&found), identity(&once[1]));
    }

    #[test]
    fn cloned_enumerator_shares_proxies() {
        let (_, _, container) = container();
        let points = unsafe { container.EnumConnectionPoints() }.unwrap();
        unsafe { points.Skip(1) }.unwrap();
        let clone = unsafe { points.Clone() }.unwrap();
        let from_clone = next_points(&clone, 1).1;
        let from_original = next_points(&points, 1).1;
        assert_eq!(identity(&from_clone[0]), identity(&from_original[0]));
    }

    #[test]
    fn proxy_points_back_to_container() {
        let (_, _, container) = container();
        let point = unsafe { container.FindConnectionPoint(&CLICKS) }.unwrap();
        let back = unsafe { point.GetConnectionPointContainer() }.unwrap();
        assert_eq!(identity(&container), identity(&back));
    }

    #[test]
    fn advise_through_found_point() {
        let _com = ComInitializeContext::new(COINIT_MULTITHREADED);
        let (clicks, _, container) = container();
        let point = unsafe { container.FindConnectionPoint(&CLICKS) }.unwrap();
        let (sink, _) = RecordingSink::create();
        let cookie = unsafe { point.Advise(&sink) }.unwrap();
        let advised = next_connections(&unsafe { clicks.EnumConnections() }.unwrap(), 4).1;
        assert_eq!(1, advised.len());
        assert_eq!(cookie, advised[0].0);
        unsafe { point.Unadvise(cookie) }.unwrap();
        let advised = next_connections(&unsafe { clicks.EnumConnections() }.unwrap(), 4).1;
        assert!(advised.is_empty());
    }

    #[test]
    fn missing_container_is_unexpected() {
        let container = HostConnectionPointContainer::create(None);
        let error = unsafe { container.FindConnectionPoint(&CLICKS) }.unwrap_err();
        assert_eq!(E_UNEXPECTED, error.code());
        let error = unsafe { container.EnumConnectionPoints() }.unwrap_err();
        assert_eq!(E_UNEXPECTED, error.code());
    }
}
