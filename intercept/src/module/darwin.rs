use crate::types::{HookError, ModuleInfo, Rebinding, SlotWrite};
use core::ffi::{c_char, c_void};
use libc::{dladdr, Dl_info};
use mach2::kern_return::KERN_SUCCESS;
use mach2::traps::mach_task_self;
use mach2::vm::mach_vm_protect;
use mach2::vm_prot::{VM_PROT_READ, VM_PROT_WRITE};

#[allow(non_camel_case_types)]
mod macho {
    // Just enough Mach-O to walk symbol-pointer sections.

    pub const MH_MAGIC_64: u32 = 0xfeedfacf;
    pub const LC_SEGMENT_64: u32 = 0x19;
    pub const LC_SYMTAB: u32 = 0x2;
    pub const LC_DYSYMTAB: u32 = 0xb;

    pub const SECTION_TYPE: u32 = 0x000000ff;
    pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x00000006;
    pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x00000007;

    pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x80000000;
    pub const INDIRECT_SYMBOL_ABS: u32 = 0x40000000;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct mach_header_64 {
        pub magic: u32,
        pub cputype: i32,
        pub cpusubtype: i32,
        pub filetype: u32,
        pub ncmds: u32,
        pub sizeofcmds: u32,
        pub flags: u32,
        pub reserved: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct load_command {
        pub cmd: u32,
        pub cmdsize: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct segment_command_64 {
        pub cmd: u32,
        pub cmdsize: u32,
        pub segname: [u8; 16],
        pub vmaddr: u64,
        pub vmsize: u64,
        pub fileoff: u64,
        pub filesize: u64,
        pub maxprot: i32,
        pub initprot: i32,
        pub nsects: u32,
        pub flags: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct section_64 {
        pub sectname: [u8; 16],
        pub segname: [u8; 16],
        pub addr: u64,
        pub size: u64,
        pub offset: u32,
        pub align: u32,
        pub reloff: u32,
        pub nreloc: u32,
        pub flags: u32,
        pub reserved1: u32,
        pub reserved2: u32,
        pub reserved3: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct symtab_command {
        pub cmd: u32,
        pub cmdsize: u32,
        pub symoff: u32,
        pub nsyms: u32,
        pub stroff: u32,
        pub strsize: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct dysymtab_command {
        pub cmd: u32,
        pub cmdsize: u32,
        pub ilocalsym: u32,
        pub nlocalsym: u32,
        pub iextdefsym: u32,
        pub nextdefsym: u32,
        pub iundefsym: u32,
        pub nundefsym: u32,
        pub tocoff: u32,
        pub ntoc: u32,
        pub modtaboff: u32,
        pub nmodtab: u32,
        pub extrefsymoff: u32,
        pub nextrefsyms: u32,
        pub indirectsymoff: u32,
        pub nindirectsyms: u32,
        pub extreloff: u32,
        pub nextrel: u32,
        pub locreloff: u32,
        pub nlocrel: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct nlist_64 {
        pub n_strx: u32,
        pub n_type: u8,
        pub n_sect: u8,
        pub n_desc: u16,
        pub n_value: u64,
    }
}

use macho::{
    dysymtab_command, load_command, mach_header_64, nlist_64, section_64, segment_command_64,
    symtab_command, INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL, LC_DYSYMTAB, LC_SEGMENT_64,
    LC_SYMTAB, MH_MAGIC_64, S_LAZY_SYMBOL_POINTERS, S_NON_LAZY_SYMBOL_POINTERS, SECTION_TYPE,
};

extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(index: u32) -> *const mach_header_64;
    fn _dyld_get_image_name(index: u32) -> *const c_char;
    fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;
}

#[inline]
fn debug_enabled() -> bool {
    std::env::var_os(super::HOOK_DEBUG_ENV).is_some()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn cstr_from_fixed_bytes(bytes: &[u8; 16]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).unwrap_or("")
}

unsafe fn load_commands(header: *const mach_header_64) -> (*const load_command, u32) {
    let cmds = (header as *const u8).add(core::mem::size_of::<mach_header_64>()) as *const load_command;
    (cmds, (*header).ncmds)
}

unsafe fn for_each_segment_64(
    header: *const mach_header_64,
    mut f: impl FnMut(&segment_command_64),
) {
    let (mut cmd, ncmds) = load_commands(header);
    for _ in 0..ncmds {
        if (*cmd).cmd == LC_SEGMENT_64 {
            f(&*(cmd as *const segment_command_64));
        }
        cmd = (cmd as *const u8).add((*cmd).cmdsize as usize) as *const load_command;
    }
}

unsafe fn for_each_section_64(header: *const mach_header_64, mut f: impl FnMut(&section_64)) {
    let (mut cmd, ncmds) = load_commands(header);
    for _ in 0..ncmds {
        if (*cmd).cmd == LC_SEGMENT_64 {
            let seg = &*(cmd as *const segment_command_64);
            let mut sec = (seg as *const segment_command_64).add(1) as *const section_64;
            for _ in 0..seg.nsects {
                f(&*sec);
                sec = sec.add(1);
            }
        }
        cmd = (cmd as *const u8).add((*cmd).cmdsize as usize) as *const load_command;
    }
}

unsafe fn find_command<T>(header: *const mach_header_64, kind: u32) -> Option<&'static T> {
    let (mut cmd, ncmds) = load_commands(header);
    for _ in 0..ncmds {
        if (*cmd).cmd == kind {
            return Some(&*(cmd as *const T));
        }
        cmd = (cmd as *const u8).add((*cmd).cmdsize as usize) as *const load_command;
    }
    None
}

unsafe fn fileoff_to_ptr(
    header: *const mach_header_64,
    slide: isize,
    fileoff: u64,
) -> Option<*const u8> {
    let mut out: Option<*const u8> = None;
    for_each_segment_64(header, |seg| {
        if out.is_some() {
            return;
        }
        let start = seg.fileoff;
        let end = seg.fileoff.saturating_add(seg.filesize);
        if fileoff >= start && fileoff < end {
            let delta = fileoff - start;
            let vmaddr = (seg.vmaddr as i128) + (slide as i128) + (delta as i128);
            out = Some(vmaddr as u64 as *const u8);
        }
    });
    out
}

unsafe fn module_range(header: *const mach_header_64, slide: isize) -> Option<(usize, usize)> {
    let mut min: Option<u64> = None;
    let mut max: u64 = 0;
    for_each_segment_64(header, |seg| {
        // __PAGEZERO has no file content and would pull the base to zero.
        if seg.vmsize == 0 || seg.filesize == 0 {
            return;
        }
        let start = (seg.vmaddr as i128 + slide as i128) as u64;
        let end = start.saturating_add(seg.vmsize);
        min = Some(min.map(|m| m.min(start)).unwrap_or(start));
        max = max.max(end);
    });
    min.map(|m| (m as usize, (max - m) as usize))
}

unsafe fn image_path(index: u32) -> String {
    let name_ptr = _dyld_get_image_name(index);
    if name_ptr.is_null() {
        String::new()
    } else {
        core::ffi::CStr::from_ptr(name_ptr).to_string_lossy().into_owned()
    }
}

/// Enumerate the 64-bit images dyld has loaded.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    let count = unsafe { _dyld_image_count() };
    let mut out = Vec::with_capacity(count as usize);

    for i in 0..count {
        unsafe {
            let header = _dyld_get_image_header(i);
            if header.is_null() || (*header).magic != MH_MAGIC_64 {
                continue;
            }

            let slide = _dyld_get_image_vmaddr_slide(i);
            let path = image_path(i);
            let (base, size) = module_range(header, slide).unwrap_or((header as usize, 0));
            let name = if path.is_empty() {
                format!("image_{i}")
            } else {
                basename(&path).to_string()
            };

            out.push(ModuleInfo {
                name,
                path,
                base_address: base,
                size,
            });
        }
    }

    out
}

/// Find an already-loaded image by file name. Never loads anything.
pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate_modules().into_iter().find(|m| m.matches(name))
}

/// Locate the dyld image index backing `module`.
unsafe fn image_for(module: &ModuleInfo) -> Option<(*const mach_header_64, isize)> {
    for i in 0.._dyld_image_count() {
        let header = _dyld_get_image_header(i);
        if header.is_null() || (*header).magic != MH_MAGIC_64 {
            continue;
        }
        if image_path(i) != module.path {
            continue;
        }
        return Some((header, _dyld_get_image_vmaddr_slide(i)));
    }
    None
}

unsafe fn make_writable(page: usize, page_sz: usize) -> Result<(), HookError> {
    if libc::mprotect(page as *mut _, page_sz, libc::PROT_READ | libc::PROT_WRITE) == 0 {
        return Ok(());
    }
    // Hardened images map __DATA_CONST read-only in a way libc's mprotect
    // refuses; Mach sometimes still allows it.
    let kr = mach_vm_protect(
        mach_task_self(),
        page as u64,
        page_sz as u64,
        0,
        VM_PROT_READ | VM_PROT_WRITE,
    );
    if kr == KERN_SUCCESS {
        return Ok(());
    }
    let errno = *libc::__error();
    if debug_enabled() {
        eprintln!(
            "[ocicancel-intercept] rebind: protect RW failed errno={} kr={} page=0x{:x}",
            errno, kr, page
        );
    }
    Err(HookError::ProtectFailed { errno })
}

/// Whether `slot` lies in a `__DATA_CONST` section, which dyld keeps
/// read-only after binding.
unsafe fn in_data_const(header: *const mach_header_64, slide: isize, slot: usize) -> bool {
    let mut found = false;
    for_each_section_64(header, |sect| {
        let start = (sect.addr as i128 + slide as i128) as usize;
        if slot >= start && slot < start + sect.size as usize {
            found = cstr_from_fixed_bytes(&sect.segname) == "__DATA_CONST";
        }
    });
    found
}

unsafe fn write_slot(
    slot: usize,
    value: usize,
    page_sz: usize,
    read_only_after: bool,
) -> Result<usize, HookError> {
    let ptr = slot as *mut usize;
    let current = core::ptr::read_unaligned(ptr);
    if current == value {
        return Ok(current);
    }
    let page = slot & !(page_sz - 1);
    make_writable(page, page_sz)?;
    core::ptr::write_unaligned(ptr, value);
    if read_only_after && libc::mprotect(page as *mut _, page_sz, libc::PROT_READ) != 0 {
        let errno = *libc::__error();
        core::ptr::write_unaligned(ptr, current);
        if debug_enabled() {
            eprintln!(
                "[ocicancel-intercept] rebind: protect R failed errno={} page=0x{:x}",
                errno, page
            );
        }
        return Err(HookError::ProtectFailed { errno });
    }
    Ok(current)
}

/// Put each slot back to its own previous value, last write first.
unsafe fn restore_slots(
    header: *const mach_header_64,
    slide: isize,
    writes: &[SlotWrite],
) -> Result<(), HookError> {
    let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let mut first_err = None;
    for write in writes.iter().rev() {
        let read_only_after = in_data_const(header, slide, write.slot);
        if let Err(e) = write_slot(write.slot, write.previous, page_sz, read_only_after) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Point every symbol pointer for `want` in one image at `replacement`.
///
/// The returned rebinding is empty if the image does not import `want`. On
/// error the pointers already written are put back.
unsafe fn rebind_symbol_in_image(
    header: *const mach_header_64,
    slide: isize,
    want: &[u8],
    replacement: usize,
) -> Result<Rebinding, HookError> {
    let symtab = find_command::<symtab_command>(header, LC_SYMTAB)
        .ok_or(HookError::InvalidImage(String::new()))?;
    let dysymtab = find_command::<dysymtab_command>(header, LC_DYSYMTAB)
        .ok_or(HookError::InvalidImage(String::new()))?;

    let resolve = |off: u32| fileoff_to_ptr(header, slide, off as u64);
    let (Some(symtab_ptr), Some(strtab_ptr), Some(indirect_ptr)) = (
        resolve(symtab.symoff),
        resolve(symtab.stroff),
        resolve(dysymtab.indirectsymoff),
    ) else {
        return Err(HookError::InvalidImage(String::new()));
    };

    let symbols = symtab_ptr as *const nlist_64;
    let indirect = indirect_ptr as *const u32;
    let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;

    let mut written: Vec<SlotWrite> = Vec::new();
    let mut failure: Option<HookError> = None;

    for_each_section_64(header, |sect| {
        if failure.is_some() {
            return;
        }
        let sec_type = sect.flags & SECTION_TYPE;
        if sec_type != S_LAZY_SYMBOL_POINTERS && sec_type != S_NON_LAZY_SYMBOL_POINTERS {
            return;
        }

        let n_ptrs = (sect.size as usize) / core::mem::size_of::<usize>();
        let start_index = sect.reserved1 as usize;
        let ptrs = (sect.addr as i128 + slide as i128) as u64 as *mut usize;
        let read_only_after = cstr_from_fixed_bytes(&sect.segname) == "__DATA_CONST";

        for j in 0..n_ptrs {
            let sym_index = *indirect.add(start_index + j);
            let slot_ptr = ptrs.add(j);

            let matches = if sym_index == INDIRECT_SYMBOL_LOCAL
                || sym_index == INDIRECT_SYMBOL_ABS
                || sym_index == (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS)
            {
                // No name in the table; ask dyld what the pointer targets.
                let mut info: Dl_info = core::mem::zeroed();
                let target = core::ptr::read_unaligned(slot_ptr);
                dladdr(target as *const c_void, &mut info) != 0
                    && !info.dli_sname.is_null()
                    && core::ffi::CStr::from_ptr(info.dli_sname).to_bytes() == &want[1..]
            } else {
                if sym_index >= symtab.nsyms {
                    continue;
                }
                let strx = (*symbols.add(sym_index as usize)).n_strx as usize;
                if strx == 0 || strx >= symtab.strsize as usize {
                    continue;
                }
                let name = core::ffi::CStr::from_ptr(strtab_ptr.add(strx) as *const c_char);
                name.to_bytes() == want
            };
            if !matches {
                continue;
            }

            let slot = slot_ptr as usize;
            match write_slot(slot, replacement, page_sz, read_only_after) {
                Ok(previous) => written.push(SlotWrite { slot, previous }),
                Err(e) => {
                    failure = Some(e);
                    return;
                }
            }
        }
    });

    if let Some(e) = failure {
        let _ = restore_slots(header, slide, &written);
        return Err(e);
    }

    Ok(Rebinding::new(written))
}

/// Rebind `symbol` as imported by one specific loaded image.
///
/// Only the lazy and non-lazy symbol pointers of `module` are rewritten;
/// other images keep calling the real function.
///
/// # Safety
/// `replacement` must be a function with the same signature and ABI as
/// `symbol`, and must stay valid for as long as the rebinding is in place.
pub unsafe fn rebind_in_module(
    module: &ModuleInfo,
    symbol: &str,
    replacement: usize,
) -> Result<Rebinding, HookError> {
    if symbol.as_bytes().contains(&0) {
        return Err(HookError::InvalidName);
    }
    let (header, slide) =
        image_for(module).ok_or_else(|| HookError::ModuleNotLoaded(module.name.clone()))?;

    // Mach-O string tables carry the C-level leading underscore.
    let mut want = Vec::with_capacity(symbol.len() + 1);
    want.push(b'_');
    want.extend_from_slice(symbol.as_bytes());

    match rebind_symbol_in_image(header, slide, &want, replacement) {
        Ok(rebinding) if rebinding.is_empty() => Err(HookError::SymbolNotFound {
            module: module.name.clone(),
            symbol: symbol.to_string(),
        }),
        Ok(rebinding) => Ok(rebinding),
        Err(HookError::InvalidImage(_)) => Err(HookError::InvalidImage(module.name.clone())),
        Err(e) => Err(e),
    }
}

/// Undo [`rebind_in_module`] by writing back each recorded pointer. Slots
/// are addressed directly, so pointers matched through `dladdr` come back
/// too even though they no longer resolve to the symbol.
///
/// # Safety
/// `rebinding` must come from `rebind_in_module` on this same module.
pub unsafe fn restore_in_module(module: &ModuleInfo, rebinding: &Rebinding) -> Result<(), HookError> {
    let (header, slide) =
        image_for(module).ok_or_else(|| HookError::ModuleNotLoaded(module.name.clone()))?;
    restore_slots(header, slide, rebinding.slots())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_modules_finds_libsystem() {
        let modules = enumerate_modules();
        assert!(
            modules.iter().any(|m| m.name.starts_with("libSystem")),
            "modules: {:?}",
            modules.iter().map(|m| &m.name).collect::<Vec<_>>()
        );
    }

    #[test]
    fn find_module_by_name_ignores_unloaded_names() {
        assert!(find_module_by_name("libclntsh.dylib.0.0-not-installed").is_none());
    }

    extern "C" fn fake_getppid() -> libc::pid_t {
        0x5eed
    }

    #[test]
    fn restore_puts_back_every_pointer_of_the_test_binary() {
        let _guard = crate::lock_hook_tests();
        let module = enumerate_modules().into_iter().next().expect("main image is first");
        let real_parent = unsafe { libc::getppid() };

        let rebinding = match unsafe { rebind_in_module(&module, "getppid", fake_getppid as usize) } {
            Ok(rebinding) => rebinding,
            // Chained-fixup binaries carry no indirect symbol pointers.
            Err(HookError::SymbolNotFound { .. }) => return,
            Err(e) => panic!("rebind failed: {e:?}"),
        };
        let before: Vec<usize> = rebinding.slots().iter().map(|w| w.previous).collect();

        unsafe { restore_in_module(&module, &rebinding) }.expect("restore getppid");
        for (write, previous) in rebinding.slots().iter().zip(before) {
            assert_eq!(unsafe { core::ptr::read_unaligned(write.slot as *const usize) }, previous);
        }
        assert_eq!(unsafe { libc::getppid() }, real_parent);
    }

    #[test]
    fn restore_on_unloaded_image_is_reported() {
        let ghost = ModuleInfo {
            name: "ghost.dylib".into(),
            path: "/nowhere/ghost.dylib".into(),
            base_address: 0x10,
            size: 0x1000,
        };
        let err = unsafe { restore_in_module(&ghost, &Rebinding::default()) }.unwrap_err();
        assert_eq!(err, HookError::ModuleNotLoaded("ghost.dylib".into()));
    }

    #[test]
    fn rebind_reports_missing_symbol_with_module_name() {
        let module = enumerate_modules()
            .into_iter()
            .find(|m| m.name.starts_with("libSystem"))
            .expect("libSystem is always loaded");
        let err = unsafe { rebind_in_module(&module, "ocicancel_no_such_import", 0x1234) }
            .unwrap_err();
        assert!(
            matches!(err, HookError::SymbolNotFound { .. } | HookError::InvalidImage(_)),
            "{err:?}"
        );
    }
}
