use crate::types::{HookError, ModuleInfo, Rebinding, SlotWrite};
use core::ffi::c_void;
use windows_sys::Win32::Foundation::GetLastError;
use windows_sys::Win32::System::LibraryLoader::{GetModuleFileNameA, GetModuleHandleA};
use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_PROTECTION_FLAGS, PAGE_READWRITE};

mod pe {
    // Offsets into the PE headers; only what the import walk needs.

    pub const DOS_MAGIC: u16 = 0x5a4d; // "MZ"
    pub const NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
    pub const E_LFANEW: usize = 0x3c;

    pub const OPTIONAL_HEADER: usize = 24;
    pub const OPT_MAGIC_PE32: u16 = 0x10b;
    pub const OPT_MAGIC_PE32_PLUS: u16 = 0x20b;
    pub const OPT_SIZE_OF_IMAGE: usize = 56;
    pub const OPT_DATA_DIRECTORY_PE32: usize = 96;
    pub const OPT_DATA_DIRECTORY_PE32_PLUS: usize = 112;

    pub const DIRECTORY_ENTRY_IMPORT: usize = 1;

    #[cfg(target_pointer_width = "64")]
    pub const ORDINAL_FLAG: usize = 1 << 63;
    #[cfg(target_pointer_width = "32")]
    pub const ORDINAL_FLAG: usize = 1 << 31;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct ImportDescriptor {
        pub original_first_thunk: u32,
        pub time_date_stamp: u32,
        pub forwarder_chain: u32,
        pub name: u32,
        pub first_thunk: u32,
    }
}

#[inline]
fn debug_enabled() -> bool {
    std::env::var_os(super::HOOK_DEBUG_ENV).is_some()
}

fn basename(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

unsafe fn read<T: Copy>(base: usize, offset: usize) -> T {
    core::ptr::read_unaligned((base + offset) as *const T)
}

/// Offset of the optional header, after validating the DOS and NT signatures.
unsafe fn optional_header(base: usize) -> Option<usize> {
    if read::<u16>(base, 0) != pe::DOS_MAGIC {
        return None;
    }
    let nt = read::<u32>(base, pe::E_LFANEW) as usize;
    if read::<u32>(base, nt) != pe::NT_SIGNATURE {
        return None;
    }
    Some(nt + pe::OPTIONAL_HEADER)
}

/// (RVA, size) of the import directory.
unsafe fn import_directory(base: usize) -> Option<(usize, usize)> {
    let opt = optional_header(base)?;
    let dirs = match read::<u16>(base, opt) {
        pe::OPT_MAGIC_PE32_PLUS => opt + pe::OPT_DATA_DIRECTORY_PE32_PLUS,
        pe::OPT_MAGIC_PE32 => opt + pe::OPT_DATA_DIRECTORY_PE32,
        _ => return None,
    };
    let entry = dirs + pe::DIRECTORY_ENTRY_IMPORT * 8;
    let rva = read::<u32>(base, entry) as usize;
    let size = read::<u32>(base, entry + 4) as usize;
    if rva == 0 || size == 0 {
        None
    } else {
        Some((rva, size))
    }
}

/// Find an already-loaded module by file name. Never loads anything.
pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    let c_name = std::ffi::CString::new(name).ok()?;
    unsafe {
        let handle = GetModuleHandleA(c_name.as_ptr() as *const u8);
        if handle.is_null() {
            return None;
        }
        let base = handle as usize;

        let mut buf = [0u8; 1024];
        let len = GetModuleFileNameA(handle, buf.as_mut_ptr(), buf.len() as u32) as usize;
        let path = String::from_utf8_lossy(&buf[..len.min(buf.len())]).into_owned();
        let size = optional_header(base)
            .map(|opt| read::<u32>(base, opt + pe::OPT_SIZE_OF_IMAGE) as usize)
            .unwrap_or(0);

        Some(ModuleInfo {
            name: if path.is_empty() {
                name.to_string()
            } else {
                basename(&path).to_string()
            },
            path,
            base_address: base,
            size,
        })
    }
}

unsafe fn write_slot(slot: usize, value: usize) -> Result<usize, HookError> {
    let ptr = slot as *mut usize;
    let current = core::ptr::read_unaligned(ptr);
    if current == value {
        return Ok(current);
    }

    let size = core::mem::size_of::<usize>();
    let mut old: PAGE_PROTECTION_FLAGS = 0;
    if VirtualProtect(ptr as *const c_void, size, PAGE_READWRITE, &mut old) == 0 {
        let errno = GetLastError() as i32;
        if debug_enabled() {
            eprintln!(
                "[ocicancel-intercept] rebind: VirtualProtect failed error={} slot=0x{:x}",
                errno, slot
            );
        }
        return Err(HookError::ProtectFailed { errno });
    }
    core::ptr::write_unaligned(ptr, value);
    let mut ignored: PAGE_PROTECTION_FLAGS = 0;
    VirtualProtect(ptr as *const c_void, size, old, &mut ignored);
    Ok(current)
}

/// Put each slot back to its own previous value, last write first.
unsafe fn restore_slots(writes: &[SlotWrite]) -> Result<(), HookError> {
    let mut first_err = None;
    for write in writes.iter().rev() {
        if let Err(e) = write_slot(write.slot, write.previous) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Point every IAT entry named `want` at `replacement`, across all DLLs the
/// module imports from. The rebinding is empty when nothing matched.
unsafe fn rebind_in_image(base: usize, want: &[u8], replacement: usize) -> Result<Rebinding, HookError> {
    let (rva, size) =
        import_directory(base).ok_or(HookError::InvalidImage(String::new()))?;
    let count = size / core::mem::size_of::<pe::ImportDescriptor>();
    let word = core::mem::size_of::<usize>();
    let mut written: Vec<SlotWrite> = Vec::new();

    for i in 0..count {
        let desc: pe::ImportDescriptor =
            read(base, rva + i * core::mem::size_of::<pe::ImportDescriptor>());
        if desc.name == 0 && desc.first_thunk == 0 {
            break;
        }
        // Without the name table a bound IAT cannot be matched by name.
        if desc.original_first_thunk == 0 {
            continue;
        }

        let mut j = 0usize;
        loop {
            let thunk: usize = read(base, desc.original_first_thunk as usize + j * word);
            if thunk == 0 {
                break;
            }
            let slot = base + desc.first_thunk as usize + j * word;
            j += 1;

            if thunk & pe::ORDINAL_FLAG != 0 {
                continue;
            }
            // IMAGE_IMPORT_BY_NAME: u16 hint, then the NUL-terminated name.
            let name_ptr = (base + thunk + 2) as *const core::ffi::c_char;
            if core::ffi::CStr::from_ptr(name_ptr).to_bytes() != want {
                continue;
            }

            match write_slot(slot, replacement) {
                Ok(previous) => written.push(SlotWrite { slot, previous }),
                Err(e) => {
                    let _ = restore_slots(&written);
                    return Err(e);
                }
            }
        }
    }

    Ok(Rebinding::new(written))
}

/// Rebind `symbol` in the import address table of one loaded module.
///
/// # Safety
/// `replacement` must be a function with the same signature and calling
/// convention as `symbol`, and must stay valid while the rebinding is in place.
pub unsafe fn rebind_in_module(
    module: &ModuleInfo,
    symbol: &str,
    replacement: usize,
) -> Result<Rebinding, HookError> {
    if symbol.as_bytes().contains(&0) {
        return Err(HookError::InvalidName);
    }
    if module.base_address == 0 || optional_header(module.base_address).is_none() {
        return Err(HookError::ModuleNotLoaded(module.name.clone()));
    }

    match rebind_in_image(module.base_address, symbol.as_bytes(), replacement) {
        Ok(rebinding) if rebinding.is_empty() => Err(HookError::SymbolNotFound {
            module: module.name.clone(),
            symbol: symbol.to_string(),
        }),
        Ok(rebinding) => Ok(rebinding),
        Err(HookError::InvalidImage(_)) => Err(HookError::InvalidImage(module.name.clone())),
        Err(e) => Err(e),
    }
}

/// Undo [`rebind_in_module`], slot by slot.
///
/// # Safety
/// `rebinding` must come from `rebind_in_module` on this same module.
pub unsafe fn restore_in_module(module: &ModuleInfo, rebinding: &Rebinding) -> Result<(), HookError> {
    if module.base_address == 0 || optional_header(module.base_address).is_none() {
        return Err(HookError::ModuleNotLoaded(module.name.clone()));
    }
    restore_slots(rebinding.slots())
}
