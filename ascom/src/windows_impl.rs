//! Windows ASCOM COM implementation
//!
//! A driver object must only be touched from the apartment that created it,
//! so every [`ComWorker`] owns one thread that initialises COM as STA,
//! creates the driver and serves requests from a channel.

use crate::{AscomDevice, AscomError, AscomResult, ComValue, NOT_IMPLEMENTED_HRESULT};
use std::mem::ManuallyDrop;
use std::ptr;
use std::thread;
use tokio::sync::{mpsc, oneshot};
use windows::{
    core::{BSTR, GUID, PCWSTR, PWSTR},
    Win32::{
        Foundation::VARIANT_BOOL,
        System::{
            Com::{
                CoCreateInstance, CoInitializeEx, CoUninitialize, CLSIDFromProgID, IDispatch,
                CLSCTX_ALL, COINIT_APARTMENTTHREADED, DISPATCH_FLAGS, DISPATCH_METHOD,
                DISPATCH_PROPERTYGET, DISPATCH_PROPERTYPUT, DISPPARAMS, EXCEPINFO, SAFEARRAY,
            },
            Registry::{
                RegCloseKey, RegEnumKeyExW, RegOpenKeyExW, RegQueryValueExW, HKEY,
                HKEY_LOCAL_MACHINE, KEY_READ, REG_SZ, REG_VALUE_TYPE,
            },
            Variant::{
                VariantClear, VARIANT, VT_ARRAY, VT_BOOL, VT_BSTR, VT_EMPTY, VT_I2, VT_I4, VT_R4,
                VT_R8, VT_UI2, VT_VARIANT,
            },
        },
    },
};

// SAFEARRAY functions from OleAut32.dll
#[link(name = "oleaut32")]
extern "system" {
    fn SafeArrayGetDim(psa: *const SAFEARRAY) -> u32;
    fn SafeArrayGetLBound(psa: *const SAFEARRAY, nDim: u32, plLbound: *mut i32) -> windows::core::HRESULT;
    fn SafeArrayGetUBound(psa: *const SAFEARRAY, nDim: u32, plUbound: *mut i32) -> windows::core::HRESULT;
    fn SafeArrayAccessData(psa: *const SAFEARRAY, ppvData: *mut *mut std::ffi::c_void) -> windows::core::HRESULT;
    fn SafeArrayUnaccessData(psa: *const SAFEARRAY) -> windows::core::HRESULT;
}

const DISPID_PROPERTYPUT: i32 = -3;

/// Largest pixel array accepted from a driver
const MAX_ARRAY_ELEMENTS: usize = 150_000_000;

/// Discover ASCOM devices by reading the Windows Registry
pub fn discover_devices(device_type: &str) -> Vec<AscomDevice> {
    let mut devices = Vec::new();

    let reg_path = format!("SOFTWARE\\ASCOM\\{} Drivers", device_type);
    tracing::debug!("Scanning ASCOM registry: {}", reg_path);
    if let Some(found) = scan_registry_path(&reg_path) {
        devices.extend(found);
    }

    // 32-bit drivers on 64-bit Windows
    let reg_path_wow = format!("SOFTWARE\\WOW6432Node\\ASCOM\\{} Drivers", device_type);
    if let Some(found) = scan_registry_path(&reg_path_wow) {
        for dev in found {
            if !devices.iter().any(|d| d.prog_id == dev.prog_id) {
                devices.push(dev);
            }
        }
    }

    tracing::info!("Found {} ASCOM {} drivers", devices.len(), device_type);
    devices
}

fn scan_registry_path(reg_path: &str) -> Option<Vec<AscomDevice>> {
    let mut devices = Vec::new();

    unsafe {
        let mut key: HKEY = HKEY::default();
        let reg_path_wide = wide(reg_path);

        if RegOpenKeyExW(
            HKEY_LOCAL_MACHINE,
            PCWSTR::from_raw(reg_path_wide.as_ptr()),
            0,
            KEY_READ,
            &mut key,
        )
        .is_err()
        {
            return None;
        }

        let mut index: u32 = 0;
        let mut name_buffer: [u16; 256] = [0; 256];

        loop {
            let mut name_len = name_buffer.len() as u32;
            if RegEnumKeyExW(
                key,
                index,
                PWSTR(name_buffer.as_mut_ptr()),
                &mut name_len,
                None,
                PWSTR::null(),
                None,
                None,
            )
            .is_err()
            {
                break;
            }

            let prog_id = String::from_utf16_lossy(&name_buffer[..name_len as usize]);
            if !prog_id.is_empty() {
                // Creating the object here can pop up driver dialogs, so the
                // registry description is used as the name
                let name = driver_description(&key, &prog_id)
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| prog_id.clone());
                devices.push(AscomDevice { prog_id, name });
            }
            index += 1;
        }

        let _ = RegCloseKey(key);
    }

    Some(devices)
}

unsafe fn driver_description(parent_key: &HKEY, prog_id: &str) -> Option<String> {
    let mut subkey: HKEY = HKEY::default();
    let prog_id_wide = wide(prog_id);

    if RegOpenKeyExW(
        *parent_key,
        PCWSTR::from_raw(prog_id_wide.as_ptr()),
        0,
        KEY_READ,
        &mut subkey,
    )
    .is_err()
    {
        return None;
    }

    let mut data_type: REG_VALUE_TYPE = REG_VALUE_TYPE(0);
    let mut data_buffer: [u8; 512] = [0; 512];
    let mut data_len = data_buffer.len() as u32;

    let result = RegQueryValueExW(
        subkey,
        PCWSTR::null(),
        None,
        Some(&mut data_type),
        Some(data_buffer.as_mut_ptr()),
        Some(&mut data_len),
    );
    let _ = RegCloseKey(subkey);

    if result.is_ok() && data_type == REG_SZ {
        let wide_slice: &[u16] = std::slice::from_raw_parts(
            data_buffer.as_ptr() as *const u16,
            (data_len as usize / 2).saturating_sub(1),
        );
        return Some(String::from_utf16_lossy(wide_slice));
    }
    None
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn to_variant(value: &ComValue) -> AscomResult<VARIANT> {
    unsafe {
        let mut var = VARIANT::default();
        let inner = &mut *var.Anonymous.Anonymous;
        match value {
            ComValue::Empty => inner.vt = VT_EMPTY,
            ComValue::Bool(b) => {
                inner.vt = VT_BOOL;
                inner.Anonymous.boolVal = if *b { VARIANT_BOOL(-1) } else { VARIANT_BOOL(0) };
            }
            ComValue::Int(i) => {
                inner.vt = VT_I4;
                inner.Anonymous.lVal = *i;
            }
            ComValue::Double(d) => {
                inner.vt = VT_R8;
                inner.Anonymous.dblVal = *d;
            }
            ComValue::Str(s) => {
                inner.vt = VT_BSTR;
                inner.Anonymous.bstrVal = ManuallyDrop::new(BSTR::from(s.as_str()));
            }
            ComValue::IntArray { .. } | ComValue::StrArray(_) => {
                return Err(AscomError::InvalidValue {
                    member: "argument".to_string(),
                    reason: "arrays cannot be passed to drivers".to_string(),
                });
            }
        }
        Ok(var)
    }
}

fn from_variant(var: &VARIANT, member: &str) -> AscomResult<ComValue> {
    unsafe {
        let inner = &*var.Anonymous.Anonymous;
        let vt = inner.vt;
        if vt.0 & VT_ARRAY.0 != 0 {
            let base = vt.0 & !VT_ARRAY.0;
            return if base == VT_BSTR.0 {
                extract_string_array(var).map(ComValue::StrArray)
            } else if base == VT_VARIANT.0 {
                // Variant arrays hold either strings or numbers
                match extract_string_array(var) {
                    Ok(strings) if strings.iter().any(|s| !s.is_empty()) => {
                        Ok(ComValue::StrArray(strings))
                    }
                    _ => extract_int_array(var)
                        .map(|(data, dim1, dim2)| ComValue::IntArray { data, dim1, dim2 }),
                }
            } else {
                extract_int_array(var).map(|(data, dim1, dim2)| ComValue::IntArray { data, dim1, dim2 })
            }
            .map_err(|reason| AscomError::InvalidValue {
                member: member.to_string(),
                reason,
            });
        }

        Ok(if vt == VT_EMPTY {
            ComValue::Empty
        } else if vt == VT_BOOL {
            ComValue::Bool(inner.Anonymous.boolVal.0 != 0)
        } else if vt == VT_I4 {
            ComValue::Int(inner.Anonymous.lVal)
        } else if vt == VT_I2 {
            ComValue::Int(inner.Anonymous.iVal as i32)
        } else if vt == VT_R8 {
            ComValue::Double(inner.Anonymous.dblVal)
        } else if vt == VT_R4 {
            ComValue::Double(inner.Anonymous.fltVal as f64)
        } else if vt == VT_BSTR {
            ComValue::Str(inner.Anonymous.bstrVal.to_string())
        } else {
            return Err(AscomError::InvalidValue {
                member: member.to_string(),
                reason: format!("unsupported VARIANT type {}", vt.0),
            });
        })
    }
}

unsafe fn array_bounds(psa: *const SAFEARRAY, dim: u32) -> Result<usize, String> {
    let mut lower: i32 = 0;
    let mut upper: i32 = 0;
    if SafeArrayGetLBound(psa, dim, &mut lower).is_err()
        || SafeArrayGetUBound(psa, dim, &mut upper).is_err()
    {
        return Err(format!("Failed to get bounds for dimension {}", dim));
    }
    if upper < lower {
        return Ok(0);
    }
    Ok((upper - lower) as usize + 1)
}

/// Extract i32 array from a 1D or 2D SAFEARRAY
unsafe fn extract_int_array(var: &VARIANT) -> Result<(Vec<i32>, usize, usize), String> {
    let inner = &*var.Anonymous.Anonymous;
    let psa: *mut SAFEARRAY = inner.Anonymous.parray;
    if psa.is_null() {
        return Err("SAFEARRAY pointer is null".to_string());
    }

    let dims = SafeArrayGetDim(psa);
    if dims == 0 || dims > 2 {
        return Err(format!("SAFEARRAY has {} dimensions, expected 1 or 2", dims));
    }
    let dim1 = array_bounds(psa, 1)?;
    let dim2 = if dims == 2 { array_bounds(psa, 2)? } else { 1 };
    let size = dim1
        .checked_mul(dim2)
        .filter(|s| *s <= MAX_ARRAY_ELEMENTS)
        .ok_or_else(|| format!("Array of {} x {} elements is too large", dim1, dim2))?;

    let mut data_ptr: *mut std::ffi::c_void = ptr::null_mut();
    if SafeArrayAccessData(psa, &mut data_ptr).is_err() || data_ptr.is_null() {
        return Err("Failed to access SAFEARRAY data".to_string());
    }

    let base_vt = inner.vt.0 & !VT_ARRAY.0;
    let result = if base_vt == VT_I4.0 {
        Ok(std::slice::from_raw_parts(data_ptr as *const i32, size).to_vec())
    } else if base_vt == VT_I2.0 {
        Ok(std::slice::from_raw_parts(data_ptr as *const i16, size)
            .iter()
            .map(|&x| x as i32)
            .collect())
    } else if base_vt == VT_UI2.0 {
        Ok(std::slice::from_raw_parts(data_ptr as *const u16, size)
            .iter()
            .map(|&x| x as i32)
            .collect())
    } else if base_vt == VT_VARIANT.0 {
        Ok(std::slice::from_raw_parts(data_ptr as *const VARIANT, size)
            .iter()
            .map(|v| match from_variant(v, "element") {
                Ok(ComValue::Int(i)) => i,
                Ok(ComValue::Double(d)) => d as i32,
                _ => 0,
            })
            .collect())
    } else {
        Err(format!("Unsupported SAFEARRAY element type: vt={}", base_vt))
    };

    let _ = SafeArrayUnaccessData(psa);
    result.map(|data| (data, dim1, dim2))
}

/// Extract string array from a 1D SAFEARRAY
unsafe fn extract_string_array(var: &VARIANT) -> Result<Vec<String>, String> {
    let inner = &*var.Anonymous.Anonymous;
    let psa: *mut SAFEARRAY = inner.Anonymous.parray;
    if psa.is_null() {
        return Err("SAFEARRAY pointer is null".to_string());
    }
    if SafeArrayGetDim(psa) != 1 {
        return Err("string arrays must have one dimension".to_string());
    }
    let size = array_bounds(psa, 1)?;

    let mut data_ptr: *mut std::ffi::c_void = ptr::null_mut();
    if SafeArrayAccessData(psa, &mut data_ptr).is_err() || data_ptr.is_null() {
        return Err("Failed to access SAFEARRAY data".to_string());
    }

    let base_vt = inner.vt.0 & !VT_ARRAY.0;
    let result = if base_vt == VT_BSTR.0 {
        Ok(std::slice::from_raw_parts(data_ptr as *const BSTR, size)
            .iter()
            .map(|b| b.to_string())
            .collect())
    } else if base_vt == VT_VARIANT.0 {
        Ok(std::slice::from_raw_parts(data_ptr as *const VARIANT, size)
            .iter()
            .map(|v| match from_variant(v, "element") {
                Ok(ComValue::Str(s)) => s,
                _ => String::new(),
            })
            .collect())
    } else {
        Err(format!("Unsupported SAFEARRAY element type for strings: vt={}", base_vt))
    };

    let _ = SafeArrayUnaccessData(psa);
    result
}

/// Turn a failed `Invoke` into an error, preferring the driver's exception info
fn invoke_error(member: &str, err: windows::core::Error, excep: &EXCEPINFO) -> AscomError {
    let hresult = err.code().0;
    if hresult == NOT_IMPLEMENTED_HRESULT || excep.scode == NOT_IMPLEMENTED_HRESULT {
        return AscomError::NotImplemented(member.to_string());
    }
    if !excep.bstrDescription.is_empty() || excep.scode != 0 {
        return AscomError::AscomException {
            code: excep.scode,
            source: excep.bstrSource.to_string(),
            description: excep.bstrDescription.to_string(),
        };
    }
    AscomError::ComError {
        hresult,
        message: format!("{} failed: {}", member, err),
    }
}

/// One driver object, only used on its owning thread
struct Driver {
    dispatch: IDispatch,
}

impl Driver {
    fn create(prog_id: &str) -> AscomResult<Self> {
        unsafe {
            let prog_id_wide = wide(prog_id);
            let clsid = CLSIDFromProgID(PCWSTR::from_raw(prog_id_wide.as_ptr())).map_err(|e| {
                AscomError::ComError {
                    hresult: e.code().0,
                    message: format!("Failed to get CLSID for {}: {}", prog_id, e),
                }
            })?;
            let dispatch: IDispatch = CoCreateInstance(&clsid, None, CLSCTX_ALL).map_err(|e| {
                AscomError::ComError {
                    hresult: e.code().0,
                    message: format!("Failed to create COM object {}: {}", prog_id, e),
                }
            })?;
            Ok(Self { dispatch })
        }
    }

    fn dispid(&self, name: &str) -> AscomResult<i32> {
        unsafe {
            let name_wide = wide(name);
            let names = [PCWSTR::from_raw(name_wide.as_ptr())];
            let mut dispid: i32 = 0;
            self.dispatch
                .GetIDsOfNames(&GUID::zeroed(), names.as_ptr(), 1, 0, &mut dispid)
                .map_err(|_| AscomError::NotImplemented(name.to_string()))?;
            Ok(dispid)
        }
    }

    fn invoke(&self, name: &str, flags: DISPATCH_FLAGS, args: &[ComValue]) -> AscomResult<ComValue> {
        let dispid = self.dispid(name)?;
        // Arguments are passed in reverse order
        let mut variants = args
            .iter()
            .rev()
            .map(to_variant)
            .collect::<AscomResult<Vec<VARIANT>>>()?;
        let mut named = DISPID_PROPERTYPUT;
        let is_put = flags == DISPATCH_PROPERTYPUT;

        let params = DISPPARAMS {
            rgvarg: if variants.is_empty() { ptr::null_mut() } else { variants.as_mut_ptr() },
            rgdispidNamedArgs: if is_put { &mut named } else { ptr::null_mut() },
            cArgs: variants.len() as u32,
            cNamedArgs: if is_put { 1 } else { 0 },
        };

        let mut excep_info = EXCEPINFO::default();
        let mut result = VARIANT::default();
        let outcome = unsafe {
            self.dispatch.Invoke(
                dispid,
                &GUID::zeroed(),
                0,
                flags,
                &params,
                if is_put { None } else { Some(&mut result) },
                Some(&mut excep_info),
                None,
            )
        };

        let value = match outcome {
            Ok(()) => from_variant(&result, name),
            Err(e) => Err(invoke_error(name, e, &excep_info)),
        };
        unsafe {
            for v in variants.iter_mut() {
                let _ = VariantClear(v);
            }
            let _ = VariantClear(&mut result);
        }
        value
    }
}

enum ComRequest {
    Get(String, oneshot::Sender<AscomResult<ComValue>>),
    Put(String, ComValue, oneshot::Sender<AscomResult<()>>),
    Call(String, Vec<ComValue>, oneshot::Sender<AscomResult<ComValue>>),
    Stop,
}

/// Async handle to a driver living on its own STA thread
pub struct ComWorker {
    prog_id: String,
    sender: mpsc::Sender<ComRequest>,
}

impl ComWorker {
    /// Start the worker thread and create the driver object on it
    pub async fn spawn(prog_id: &str) -> AscomResult<Self> {
        let (tx, mut rx) = mpsc::channel::<ComRequest>(32);
        let (ready_tx, ready_rx) = oneshot::channel::<AscomResult<()>>();
        let thread_prog_id = prog_id.to_string();

        thread::Builder::new()
            .name(format!("ascom-{}", prog_id))
            .spawn(move || {
                if let Err(e) = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED) } {
                    let _ = ready_tx.send(Err(AscomError::ComError {
                        hresult: e.code().0,
                        message: format!("Failed to initialize COM: {}", e),
                    }));
                    return;
                }

                match Driver::create(&thread_prog_id) {
                    Ok(driver) => {
                        tracing::info!("Created ASCOM COM object for: {}", thread_prog_id);
                        let _ = ready_tx.send(Ok(()));
                        while let Some(request) = rx.blocking_recv() {
                            match request {
                                ComRequest::Get(name, reply) => {
                                    let _ = reply.send(driver.invoke(&name, DISPATCH_PROPERTYGET, &[]));
                                }
                                ComRequest::Put(name, value, reply) => {
                                    let _ = reply.send(
                                        driver
                                            .invoke(&name, DISPATCH_PROPERTYPUT, &[value])
                                            .map(|_| ()),
                                    );
                                }
                                ComRequest::Call(name, args, reply) => {
                                    let _ = reply.send(driver.invoke(&name, DISPATCH_METHOD, &args));
                                }
                                ComRequest::Stop => break,
                            }
                        }
                        // The driver must be released before COM is torn down
                        drop(driver);
                        tracing::debug!("ASCOM worker for {} stopped", thread_prog_id);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
                unsafe { CoUninitialize() };
            })
            .map_err(|e| AscomError::ComError {
                hresult: 0,
                message: format!("Failed to start ASCOM worker thread: {}", e),
            })?;

        ready_rx
            .await
            .map_err(|_| AscomError::WorkerGone(prog_id.to_string()))??;

        Ok(Self {
            prog_id: prog_id.to_string(),
            sender: tx,
        })
    }

    pub fn prog_id(&self) -> &str {
        &self.prog_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<AscomResult<T>>) -> ComRequest,
    ) -> AscomResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(build(reply_tx))
            .await
            .map_err(|_| AscomError::WorkerGone(self.prog_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| AscomError::WorkerGone(self.prog_id.clone()))?
    }

    /// Read a property
    pub async fn get(&self, name: &str) -> AscomResult<ComValue> {
        self.request(|reply| ComRequest::Get(name.to_string(), reply))
            .await
    }

    /// Write a property
    pub async fn put(&self, name: &str, value: ComValue) -> AscomResult<()> {
        self.request(|reply| ComRequest::Put(name.to_string(), value, reply))
            .await
    }

    /// Call a method, positional arguments in declaration order
    pub async fn call(&self, name: &str, args: Vec<ComValue>) -> AscomResult<ComValue> {
        self.request(|reply| ComRequest::Call(name.to_string(), args, reply))
            .await
    }

    /// Stop the worker; the driver is released on its own thread
    pub async fn shutdown(&self) {
        // A closed channel means the worker already exited
        let _ = self.sender.send(ComRequest::Stop).await;
    }
}
