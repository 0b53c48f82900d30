//! Minimal safe wrapper around the WFP engine calls the kill switch needs:
//! a dynamic session, one provider, one sublayer, add/delete filters.

use std::ffi::c_void;

use windows::Win32::Foundation::HANDLE;
use windows::Win32::NetworkManagement::WindowsFilteringPlatform::{
    FWP_ACTION_BLOCK, FWP_ACTION_PERMIT, FWP_BYTE_BLOB, FWP_BYTE_BLOB_TYPE,
    FWP_CONDITION_VALUE0, FWP_CONDITION_VALUE0_0, FWP_MATCH_TYPE, FWP_UINT8, FWP_UINT16,
    FWP_UINT32, FWP_UINT64, FWP_V4_ADDR_AND_MASK, FWP_V4_ADDR_MASK, FWP_V6_ADDR_AND_MASK,
    FWP_V6_ADDR_MASK, FWP_VALUE0, FWP_VALUE0_0, FWPM_DISPLAY_DATA0, FWPM_FILTER0,
    FWPM_FILTER_CONDITION0, FWPM_PROVIDER0, FWPM_SESSION0, FWPM_SESSION_FLAG_DYNAMIC,
    FWPM_SUBLAYER0, FwpmEngineClose0, FwpmEngineOpen0, FwpmFilterAdd0, FwpmFilterDeleteById0,
    FwpmFreeMemory0, FwpmGetAppIdFromFileName0, FwpmProviderAdd0, FwpmSubLayerAdd0,
};
use windows::core::{GUID, HRESULT, PCWSTR, PWSTR, Result};

const RPC_C_AUTHN_DEFAULT: u32 = 0xFFFF_FFFF;

/// Fresh random GUID for providers, sublayers and filters.
pub fn new_guid() -> GUID {
    GUID::from_u128(uuid::Uuid::new_v4().as_u128())
}

fn check(status: u32) -> Result<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(windows::core::Error::from_hresult(HRESULT(status as i32)))
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// The daemon executable's ALE app id, owned until drop.
pub struct AppId {
    blob: *mut FWP_BYTE_BLOB,
}

// The blob is only read after construction.
unsafe impl Send for AppId {}
unsafe impl Sync for AppId {}

impl AppId {
    pub fn current_exe() -> Result<Self> {
        let path = std::env::current_exe().map_err(|e| {
            windows::core::Error::new(
                windows::core::HRESULT::from_win32(e.raw_os_error().unwrap_or(2) as u32),
                "current_exe",
            )
        })?;
        let path = wide(&path.to_string_lossy());

        let mut blob: *mut FWP_BYTE_BLOB = std::ptr::null_mut();
        // SAFETY: `path` is a valid nul-terminated wide string and `blob`
        // receives an allocation we free in Drop.
        check(unsafe { FwpmGetAppIdFromFileName0(PCWSTR(path.as_ptr()), &mut blob) })?;

        Ok(Self { blob })
    }
}

impl Drop for AppId {
    fn drop(&mut self) {
        if !self.blob.is_null() {
            // SAFETY: the blob came from FwpmGetAppIdFromFileName0.
            unsafe { FwpmFreeMemory0(&mut self.blob as *mut _ as *mut *mut c_void) };
        }
    }
}

/// An owned condition value; pointer-shaped variants stay alive for the
/// duration of the `FwpmFilterAdd0` call.
pub enum ConditionValue {
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    AppId(AppId),
    V4AddrMask { addr: u32, mask: u32 },
    V6AddrMask { addr: [u8; 16], prefix_length: u8 },
}

pub struct Condition {
    pub field: GUID,
    pub match_type: FWP_MATCH_TYPE,
    pub value: ConditionValue,
}

pub struct FilterSpec {
    pub name: String,
    pub layer: GUID,
    pub permit: bool,
    pub weight: u64,
    pub conditions: Vec<Condition>,
}

/// A dynamic WFP session. Dropping (or closing) the session removes every
/// object added through it.
pub struct Session {
    engine: HANDLE,
}

// The engine handle is protected by the caller's lock.
unsafe impl Send for Session {}
unsafe impl Sync for Session {}

impl Session {
    pub fn open(name: &str, description: &str) -> Result<Self> {
        let mut name = wide(name);
        let mut description = wide(description);

        let session = FWPM_SESSION0 {
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_mut_ptr()),
                description: PWSTR(description.as_mut_ptr()),
            },
            flags: FWPM_SESSION_FLAG_DYNAMIC,
            ..Default::default()
        };

        let mut engine = HANDLE::default();
        // SAFETY: all pointers reference locals that outlive the call.
        check(unsafe {
            FwpmEngineOpen0(
                PCWSTR::null(),
                RPC_C_AUTHN_DEFAULT,
                None,
                Some(&session),
                &mut engine,
            )
        })?;

        Ok(Self { engine })
    }

    pub fn add_provider(&self, key: GUID, name: &str) -> Result<()> {
        let mut name = wide(name);
        let provider = FWPM_PROVIDER0 {
            providerKey: key,
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_mut_ptr()),
                description: PWSTR::null(),
            },
            ..Default::default()
        };
        // SAFETY: `provider` and the name buffer outlive the call.
        check(unsafe { FwpmProviderAdd0(self.engine, &provider, None) })
    }

    pub fn add_sublayer(&self, key: GUID, name: &str, weight: u16) -> Result<()> {
        let mut name = wide(name);
        let sublayer = FWPM_SUBLAYER0 {
            subLayerKey: key,
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_mut_ptr()),
                description: PWSTR::null(),
            },
            weight,
            ..Default::default()
        };
        // SAFETY: `sublayer` and the name buffer outlive the call.
        check(unsafe { FwpmSubLayerAdd0(self.engine, &sublayer, None) })
    }

    /// Adds one filter and returns its runtime id.
    pub fn add_filter(
        &self,
        provider: &GUID,
        sublayer: GUID,
        spec: &FilterSpec,
    ) -> Result<u64> {
        let mut name = wide(&spec.name);

        // Pointer-shaped condition values live here for the call duration.
        let mut u64_storage: Vec<Box<u64>> = Vec::new();
        let mut v4_storage: Vec<Box<FWP_V4_ADDR_AND_MASK>> = Vec::new();
        let mut v6_storage: Vec<Box<FWP_V6_ADDR_AND_MASK>> = Vec::new();

        let mut conditions: Vec<FWPM_FILTER_CONDITION0> = Vec::with_capacity(spec.conditions.len());
        for condition in &spec.conditions {
            let value = match &condition.value {
                ConditionValue::Uint8(v) => FWP_CONDITION_VALUE0 {
                    r#type: FWP_UINT8,
                    Anonymous: FWP_CONDITION_VALUE0_0 { uint8: *v },
                },
                ConditionValue::Uint16(v) => FWP_CONDITION_VALUE0 {
                    r#type: FWP_UINT16,
                    Anonymous: FWP_CONDITION_VALUE0_0 { uint16: *v },
                },
                ConditionValue::Uint32(v) => FWP_CONDITION_VALUE0 {
                    r#type: FWP_UINT32,
                    Anonymous: FWP_CONDITION_VALUE0_0 { uint32: *v },
                },
                ConditionValue::Uint64(v) => {
                    u64_storage.push(Box::new(*v));
                    FWP_CONDITION_VALUE0 {
                        r#type: FWP_UINT64,
                        Anonymous: FWP_CONDITION_VALUE0_0 {
                            uint64: &mut **u64_storage.last_mut().expect("just pushed"),
                        },
                    }
                }
                ConditionValue::AppId(app_id) => FWP_CONDITION_VALUE0 {
                    r#type: FWP_BYTE_BLOB_TYPE,
                    Anonymous: FWP_CONDITION_VALUE0_0 {
                        byteBlob: app_id.blob,
                    },
                },
                ConditionValue::V4AddrMask { addr, mask } => {
                    v4_storage.push(Box::new(FWP_V4_ADDR_AND_MASK {
                        addr: *addr,
                        mask: *mask,
                    }));
                    FWP_CONDITION_VALUE0 {
                        r#type: FWP_V4_ADDR_MASK,
                        Anonymous: FWP_CONDITION_VALUE0_0 {
                            v4AddrMask: &mut **v4_storage.last_mut().expect("just pushed"),
                        },
                    }
                }
                ConditionValue::V6AddrMask {
                    addr,
                    prefix_length,
                } => {
                    v6_storage.push(Box::new(FWP_V6_ADDR_AND_MASK {
                        addr: *addr,
                        prefixLength: *prefix_length,
                    }));
                    FWP_CONDITION_VALUE0 {
                        r#type: FWP_V6_ADDR_MASK,
                        Anonymous: FWP_CONDITION_VALUE0_0 {
                            v6AddrMask: &mut **v6_storage.last_mut().expect("just pushed"),
                        },
                    }
                }
            };

            conditions.push(FWPM_FILTER_CONDITION0 {
                fieldKey: condition.field,
                matchType: condition.match_type,
                conditionValue: value,
            });
        }

        let mut weight = spec.weight;
        let mut filter = FWPM_FILTER0 {
            filterKey: new_guid(),
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_mut_ptr()),
                description: PWSTR::null(),
            },
            providerKey: provider as *const GUID as *mut GUID,
            layerKey: spec.layer,
            subLayerKey: sublayer,
            weight: FWP_VALUE0 {
                r#type: FWP_UINT64,
                Anonymous: FWP_VALUE0_0 {
                    uint64: &mut weight,
                },
            },
            numFilterConditions: conditions.len() as u32,
            filterCondition: conditions.as_mut_ptr(),
            ..Default::default()
        };
        filter.action.r#type = if spec.permit {
            FWP_ACTION_PERMIT
        } else {
            FWP_ACTION_BLOCK
        };

        let mut id = 0u64;
        // SAFETY: `filter` and everything it points into (name, weight,
        // conditions and their boxed values) outlive the call.
        check(unsafe { FwpmFilterAdd0(self.engine, &filter, None, Some(&mut id)) })?;

        Ok(id)
    }

    pub fn delete_filter(&self, id: u64) -> Result<()> {
        // SAFETY: the engine handle is valid while `self` lives.
        check(unsafe { FwpmFilterDeleteById0(self.engine, id) })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.engine.is_invalid() {
            // SAFETY: closing a dynamic session drops all its objects.
            let status = unsafe { FwpmEngineClose0(self.engine) };
            if status != 0 {
                tracing::warn!(status, "Failed to close WFP session");
            }
        }
    }
}
