//! Late-bound COM calls through `IDispatch`.
//!
//! Excel's automation model is reached by member name at call time. Every call
//! goes through [`Dispatch::invoke`]; the other methods are shorthands for
//! property gets, puts and method calls.

#![cfg(windows)]

use std::mem::ManuallyDrop;
use std::ptr;

use windows::{
    core::{IUnknown, Interface, BSTR, GUID, HSTRING, PCWSTR},
    Win32::{
        Foundation::{DISP_E_EXCEPTION, DISP_E_PARAMNOTFOUND, VARIANT_BOOL},
        Globalization::GetSystemDefaultLCID,
        System::{
            Com::{
                CLSIDFromProgID, CoCreateInstance, IDispatch, CLSCTX_LOCAL_SERVER, DISPATCH_FLAGS,
                DISPATCH_METHOD, DISPATCH_PROPERTYGET, DISPATCH_PROPERTYPUT, DISPPARAMS, EXCEPINFO,
            },
            Ole::DISPID_PROPERTYPUT,
            Variant::{
                VARIANT, VT_BOOL, VT_BSTR, VT_DISPATCH, VT_EMPTY, VT_ERROR, VT_I2, VT_I4, VT_I8,
                VT_NULL, VT_R4, VT_R8,
            },
        },
    },
};

// The VARIANT unions sit behind ManuallyDrop, so fields are written with
// ptr::write rather than assignment.

pub fn empty() -> VARIANT {
    VARIANT::default()
}

pub fn from_bool(val: bool) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_BOOL);
        ptr::write(
            &mut inner.Anonymous.boolVal,
            VARIANT_BOOL(if val { -1 } else { 0 }),
        );
        v
    }
}

pub fn from_f64(val: f64) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_R8);
        ptr::write(&mut inner.Anonymous.dblVal, val);
        v
    }
}

pub fn from_i32(val: i32) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_I4);
        ptr::write(&mut inner.Anonymous.lVal, val);
        v
    }
}

pub fn from_str(val: &str) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_BSTR);
        ptr::write(&mut inner.Anonymous.bstrVal, ManuallyDrop::new(BSTR::from(val)));
        v
    }
}

pub fn from_object(object: &Dispatch) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_DISPATCH);
        ptr::write(
            &mut inner.Anonymous.pdispVal,
            ManuallyDrop::new(Some(object.inner.clone())),
        );
        v
    }
}

fn from_scode(scode: i32) -> VARIANT {
    unsafe {
        let mut v = VARIANT::default();
        let inner = &mut *v.Anonymous.Anonymous;
        ptr::write(&mut inner.vt, VT_ERROR);
        ptr::write(&mut inner.Anonymous.scode, scode);
        v
    }
}

/// An omitted optional argument in a positional call.
pub fn missing() -> VARIANT {
    from_scode(DISP_E_PARAMNOTFOUND.0)
}

// CVErr(n) travels as VT_ERROR with this facility prefix.
const CVERR_BASE: u32 = 0x800A_0000;

/// Excel error value `CVErr(number)`, e.g. 2007 for `#DIV/0!`.
pub fn from_cverr(number: i32) -> VARIANT {
    from_scode((CVERR_BASE | number as u32) as i32)
}

/// `CVErr` number carried by an error variant
pub fn as_cverr(v: &VARIANT) -> Option<i32> {
    if !is_error(v) {
        return None;
    }
    let scode = unsafe { v.Anonymous.Anonymous.Anonymous.scode } as u32;
    (scode & 0xFFFF_0000 == CVERR_BASE).then_some((scode & 0xFFFF) as i32)
}

fn vt(v: &VARIANT) -> u16 {
    unsafe { v.Anonymous.Anonymous.vt.0 }
}

pub fn is_empty(v: &VARIANT) -> bool {
    unsafe {
        let vt = v.Anonymous.Anonymous.vt;
        vt == VT_EMPTY || vt == VT_NULL
    }
}

pub fn is_error(v: &VARIANT) -> bool {
    unsafe { v.Anonymous.Anonymous.vt == VT_ERROR }
}

pub fn as_bool(v: &VARIANT) -> Option<bool> {
    unsafe {
        (v.Anonymous.Anonymous.vt == VT_BOOL)
            .then(|| v.Anonymous.Anonymous.Anonymous.boolVal.0 != 0)
    }
}

pub fn as_f64(v: &VARIANT) -> Option<f64> {
    unsafe {
        let vt = v.Anonymous.Anonymous.vt;
        let value = &v.Anonymous.Anonymous.Anonymous;
        if vt == VT_R8 {
            Some(value.dblVal)
        } else if vt == VT_R4 {
            Some(value.fltVal as f64)
        } else if vt == VT_I4 {
            Some(value.lVal as f64)
        } else if vt == VT_I2 {
            Some(value.iVal as f64)
        } else {
            None
        }
    }
}

/// Integer-valued properties such as `Hwnd`, `Count` and `Row`.
pub fn as_i64(v: &VARIANT) -> Option<i64> {
    unsafe {
        let vt = v.Anonymous.Anonymous.vt;
        let value = &v.Anonymous.Anonymous.Anonymous;
        if vt == VT_I4 {
            Some(value.lVal as i64)
        } else if vt == VT_I8 {
            Some(value.llVal)
        } else if vt == VT_I2 {
            Some(value.iVal as i64)
        } else if vt == VT_R8 && value.dblVal.fract() == 0.0 {
            Some(value.dblVal as i64)
        } else {
            None
        }
    }
}

pub fn as_string(v: &VARIANT) -> Option<String> {
    unsafe {
        (v.Anonymous.Anonymous.vt == VT_BSTR)
            .then(|| v.Anonymous.Anonymous.Anonymous.bstrVal.to_string())
    }
}

fn as_object(v: &VARIANT, member: &str) -> Result<Dispatch, String> {
    unsafe {
        if v.Anonymous.Anonymous.vt == VT_DISPATCH {
            let object: &Option<IDispatch> = &v.Anonymous.Anonymous.Anonymous.pdispVal;
            if let Some(inner) = object.clone() {
                return Ok(Dispatch { inner });
            }
        }
    }
    if is_empty(v) {
        Err(format!("'{member}' returned nothing"))
    } else {
        Err(format!("'{member}' returned VT={} instead of an object", vt(v)))
    }
}

/// A COM object reached through `IDispatch`.
#[derive(Clone)]
pub struct Dispatch {
    inner: IDispatch,
}

impl Dispatch {
    /// Instantiate an out-of-process server by ProgID, e.g. `Excel.Application`.
    pub fn create(progid: &str) -> Result<Self, String> {
        unsafe {
            let clsid = CLSIDFromProgID(&HSTRING::from(progid))
                .map_err(|e| format!("CLSIDFromProgID('{progid}') failed: {e}"))?;
            let inner: IDispatch = CoCreateInstance(&clsid, None, CLSCTX_LOCAL_SERVER)
                .map_err(|e| format!("CoCreateInstance('{progid}') failed: {e}"))?;
            Ok(Self { inner })
        }
    }

    /// COM identity: both wrap the same underlying object.
    pub fn same_object(&self, other: &Dispatch) -> bool {
        match (self.inner.cast::<IUnknown>(), other.inner.cast::<IUnknown>()) {
            (Ok(a), Ok(b)) => a.as_raw() == b.as_raw(),
            _ => false,
        }
    }

    fn dispid(&self, member: &str) -> Result<i32, String> {
        let wide: Vec<u16> = member.encode_utf16().chain(std::iter::once(0)).collect();
        let names = [PCWSTR(wide.as_ptr())];
        let mut dispid = 0i32;
        unsafe {
            self.inner
                .GetIDsOfNames(
                    &GUID::zeroed(),
                    names.as_ptr(),
                    1,
                    GetSystemDefaultLCID(),
                    &mut dispid,
                )
                .map_err(|e| format!("Unknown member '{member}': {e}"))?;
        }
        Ok(dispid)
    }

    /// Invoke `member` with positional `args` given in natural order.
    pub fn invoke(
        &self,
        flags: DISPATCH_FLAGS,
        member: &str,
        args: &[VARIANT],
    ) -> Result<VARIANT, String> {
        let dispid = self.dispid(member)?;
        // DISPPARAMS wants the arguments last-to-first.
        let mut reversed: Vec<VARIANT> = args.iter().rev().cloned().collect();
        let mut put_id = [DISPID_PROPERTYPUT];
        let is_put = flags == DISPATCH_PROPERTYPUT;
        let params = DISPPARAMS {
            rgvarg: if reversed.is_empty() {
                ptr::null_mut()
            } else {
                reversed.as_mut_ptr()
            },
            rgdispidNamedArgs: if is_put {
                put_id.as_mut_ptr()
            } else {
                ptr::null_mut()
            },
            cArgs: reversed.len() as u32,
            cNamedArgs: u32::from(is_put),
        };

        let mut result = VARIANT::default();
        let mut except = EXCEPINFO::default();
        unsafe {
            self.inner
                .Invoke(
                    dispid,
                    &GUID::zeroed(),
                    GetSystemDefaultLCID(),
                    flags,
                    &params,
                    (!is_put).then_some(&mut result as *mut VARIANT),
                    Some(&mut except),
                    None,
                )
                .map_err(|e| describe_failure(e, &except, member))?;
        }
        Ok(result)
    }

    pub fn get(&self, member: &str) -> Result<VARIANT, String> {
        self.invoke(DISPATCH_PROPERTYGET, member, &[])
    }

    /// Parameterized property get, e.g. `Worksheets.Item(2)` or `Rows(5)`.
    pub fn get_with(&self, member: &str, args: &[VARIANT]) -> Result<VARIANT, String> {
        self.invoke(DISPATCH_PROPERTYGET, member, args)
    }

    pub fn put(&self, member: &str, value: VARIANT) -> Result<(), String> {
        self.invoke(DISPATCH_PROPERTYPUT, member, &[value])?;
        Ok(())
    }

    pub fn call(&self, member: &str, args: &[VARIANT]) -> Result<VARIANT, String> {
        self.invoke(DISPATCH_METHOD, member, args)
    }

    /// Property that returns an object, e.g. `Workbooks` or `Font`.
    pub fn child(&self, member: &str) -> Result<Dispatch, String> {
        as_object(&self.get(member)?, member)
    }

    pub fn child_with(&self, member: &str, args: &[VARIANT]) -> Result<Dispatch, String> {
        as_object(&self.get_with(member, args)?, member)
    }

    /// Method that returns an object, e.g. `Workbooks.Add()`.
    pub fn call_child(&self, member: &str, args: &[VARIANT]) -> Result<Dispatch, String> {
        as_object(&self.call(member, args)?, member)
    }

    /// Object-valued property that may legitimately be absent, e.g. `ActiveWindow`.
    pub fn optional_child(&self, member: &str) -> Result<Option<Dispatch>, String> {
        let value = self.get(member)?;
        if is_empty(&value) {
            return Ok(None);
        }
        as_object(&value, member).map(Some)
    }

    pub fn get_i64(&self, member: &str) -> Result<i64, String> {
        let value = self.get(member)?;
        as_i64(&value).ok_or_else(|| format!("'{member}' is not an integer (VT={})", vt(&value)))
    }

    pub fn get_f64(&self, member: &str) -> Result<f64, String> {
        let value = self.get(member)?;
        as_f64(&value).ok_or_else(|| format!("'{member}' is not a number (VT={})", vt(&value)))
    }

    pub fn get_string(&self, member: &str) -> Result<String, String> {
        let value = self.get(member)?;
        as_string(&value).ok_or_else(|| format!("'{member}' is not a string (VT={})", vt(&value)))
    }
}

fn describe_failure(err: windows::core::Error, except: &EXCEPINFO, member: &str) -> String {
    if err.code() != DISP_E_EXCEPTION {
        return format!("Invoke('{member}') failed: {err}");
    }
    let description = if except.bstrDescription.is_empty() {
        "(no description)".to_string()
    } else {
        except.bstrDescription.to_string()
    };
    if except.bstrSource.is_empty() {
        format!("COM exception in '{member}': {description}")
    } else {
        format!(
            "COM exception in '{member}': {description} (source: {})",
            except.bstrSource
        )
    }
}
