use crate::types::{HookError, ModuleInfo, Rebinding, SlotWrite};
use core::ffi::{c_char, c_void};
use std::ffi::CStr;

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[inline]
fn debug_enabled() -> bool {
    std::env::var_os(super::HOOK_DEBUG_ENV).is_some()
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Path of the object described by `info`. The main executable reports an
/// empty name, so it is read back from /proc/self/exe.
unsafe fn module_path(info: &libc::dl_phdr_info) -> String {
    if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
        match std::fs::read_link("/proc/self/exe") {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(_) => String::new(),
        }
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    }
}

/// Lowest mapped address and span of the PT_LOAD segments.
unsafe fn module_range(info: &libc::dl_phdr_info) -> (usize, usize) {
    let mut min_addr: Option<u64> = None;
    let mut max_addr: u64 = 0;
    let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    for phdr in phdrs {
        if phdr.p_type == libc::PT_LOAD && phdr.p_memsz > 0 {
            let start = phdr.p_vaddr;
            let end = start + phdr.p_memsz;
            min_addr = Some(min_addr.map(|m: u64| m.min(start)).unwrap_or(start));
            max_addr = max_addr.max(end);
        }
    }

    let base = info.dlpi_addr as usize + min_addr.unwrap_or(0) as usize;
    let size = match min_addr {
        Some(min) => (max_addr - min) as usize,
        None => 0,
    };
    (base, size)
}

/// Enumerate all loaded shared objects via `dl_iterate_phdr`.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let modules = &mut *(data as *mut Vec<ModuleInfo>);
        let info = &*info;

        let path = module_path(info);
        let (base_address, size) = module_range(info);
        let name = if path.is_empty() {
            String::from("[unknown]")
        } else {
            basename(&path).to_string()
        };

        modules.push(ModuleInfo {
            name,
            path,
            base_address,
            size,
        });

        0
    }

    let mut modules: Vec<ModuleInfo> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut modules as *mut Vec<ModuleInfo> as *mut c_void);
    }
    modules
}

/// Find an already-loaded module by file name. Never loads anything.
pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate_modules().into_iter().find(|m| m.matches(name))
}

mod elf {
    pub const DT_NULL: i64 = 0;
    pub const DT_PLTRELSZ: i64 = 2;
    pub const DT_STRTAB: i64 = 5;
    pub const DT_SYMTAB: i64 = 6;
    pub const DT_RELA: i64 = 7;
    pub const DT_RELASZ: i64 = 8;
    pub const DT_STRSZ: i64 = 10;
    pub const DT_JMPREL: i64 = 23;

    pub const PT_GNU_RELRO: u32 = 0x6474_e552;

    #[cfg(target_arch = "x86_64")]
    pub const R_GLOB_DAT: u32 = 6;
    #[cfg(target_arch = "x86_64")]
    pub const R_JUMP_SLOT: u32 = 7;

    #[cfg(target_arch = "aarch64")]
    pub const R_GLOB_DAT: u32 = 1025;
    #[cfg(target_arch = "aarch64")]
    pub const R_JUMP_SLOT: u32 = 1026;

    #[cfg(target_arch = "riscv64")]
    pub const R_GLOB_DAT: u32 = 2; // R_RISCV_64
    #[cfg(target_arch = "riscv64")]
    pub const R_JUMP_SLOT: u32 = 5;

    // 64-bit RELA layouts only; other targets never match.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
    pub const R_GLOB_DAT: u32 = u32::MAX;
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
    pub const R_JUMP_SLOT: u32 = u32::MAX - 1;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Dyn {
        pub d_tag: i64,
        pub d_val: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Rela {
        pub r_offset: u64,
        pub r_info: u64,
        pub r_addend: i64,
    }

    impl Elf64Rela {
        pub fn sym(&self) -> usize {
            (self.r_info >> 32) as usize
        }

        pub fn kind(&self) -> u32 {
            (self.r_info & 0xffff_ffff) as u32
        }

        /// GOT / PLT slots filled by the dynamic linker with a symbol address.
        pub fn is_import_slot(&self) -> bool {
            matches!(self.kind(), R_GLOB_DAT | R_JUMP_SLOT)
        }
    }
}

/// Linkage tables of one loaded image, with DT addresses already resolved.
struct Linkage {
    base: usize,
    symtab: *const elf::Elf64Sym,
    strtab: *const u8,
    strsz: usize,
    tables: [(*const elf::Elf64Rela, usize); 2],
    /// Page-aligned part of PT_GNU_RELRO that ld.so made read-only.
    relro: (usize, usize),
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Pages ld.so write-protects for a PT_GNU_RELRO segment. Both ends are
/// rounded down: a partial last page shares its tail with writable data
/// and stays writable.
fn relro_pages(start: usize, memsz: usize, page_sz: usize) -> (usize, usize) {
    let mask = !(page_sz - 1);
    (start & mask, (start + memsz) & mask)
}

unsafe fn read_linkage(info: &libc::dl_phdr_info) -> Option<Linkage> {
    let base = info.dlpi_addr as usize;
    let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);

    let mut dynamic_ptr: *const elf::Elf64Dyn = core::ptr::null();
    let mut relro = (0usize, 0usize);
    for phdr in phdrs {
        match phdr.p_type {
            libc::PT_DYNAMIC => {
                dynamic_ptr = (base as u64 + phdr.p_vaddr) as *const elf::Elf64Dyn;
            }
            elf::PT_GNU_RELRO => {
                relro = relro_pages(
                    base + phdr.p_vaddr as usize,
                    phdr.p_memsz as usize,
                    page_size(),
                );
            }
            _ => {}
        }
    }
    if dynamic_ptr.is_null() {
        return None;
    }

    let mut jmprel_val: u64 = 0;
    let mut jmprel_size: usize = 0;
    let mut rela_val: u64 = 0;
    let mut rela_size: usize = 0;
    let mut symtab_val: u64 = 0;
    let mut strtab_val: u64 = 0;
    let mut strsz: usize = 0;

    let mut dyn_entry = dynamic_ptr;
    loop {
        let entry = &*dyn_entry;
        if entry.d_tag == elf::DT_NULL {
            break;
        }
        match entry.d_tag {
            elf::DT_JMPREL => jmprel_val = entry.d_val,
            elf::DT_PLTRELSZ => jmprel_size = entry.d_val as usize,
            elf::DT_RELA => rela_val = entry.d_val,
            elf::DT_RELASZ => rela_size = entry.d_val as usize,
            elf::DT_SYMTAB => symtab_val = entry.d_val,
            elf::DT_STRTAB => strtab_val = entry.d_val,
            elf::DT_STRSZ => strsz = entry.d_val as usize,
            _ => {}
        }
        dyn_entry = dyn_entry.add(1);
    }

    if symtab_val == 0 || strtab_val == 0 {
        return None;
    }

    // ld.so relocates DT pointers in place for ordinary objects; the vDSO
    // keeps file-relative values.
    let base_u64 = info.dlpi_addr;
    let adjusted = symtab_val > base_u64 || strtab_val > base_u64;
    let resolve = |val: u64| -> usize {
        if val == 0 {
            0
        } else if adjusted {
            val as usize
        } else {
            (base_u64 + val) as usize
        }
    };

    Some(Linkage {
        base,
        symtab: resolve(symtab_val) as *const elf::Elf64Sym,
        strtab: resolve(strtab_val) as *const u8,
        strsz,
        tables: [
            (resolve(jmprel_val) as *const elf::Elf64Rela, jmprel_size),
            (resolve(rela_val) as *const elf::Elf64Rela, rela_size),
        ],
        relro,
    })
}

/// Linkage of the image whose lowest PT_LOAD is mapped at `base_address`.
///
/// `None` when no such image is loaded; `Some(None)` when it is loaded but
/// has no usable dynamic section.
unsafe fn linkage_at(base_address: usize) -> Option<Option<Linkage>> {
    struct Ctx {
        base_address: usize,
        found: Option<Option<Linkage>>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = &mut *(data as *mut Ctx);
        let info = &*info;
        let (base, _) = module_range(info);
        if base != ctx.base_address {
            return 0;
        }
        ctx.found = Some(read_linkage(info));
        1
    }

    let mut ctx = Ctx {
        base_address,
        found: None,
    };
    libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    ctx.found
}

/// Write `value` into one GOT slot, returning what it held before.
///
/// Slots on RELRO pages go back to read-only once written. If that fails
/// the old value is put back and the write is reported as failed.
unsafe fn write_slot(
    slot: usize,
    value: usize,
    page_sz: usize,
    relro: (usize, usize),
) -> Result<usize, HookError> {
    let ptr = slot as *mut usize;
    let current = core::ptr::read_unaligned(ptr);
    if current == value {
        return Ok(current);
    }

    let page = slot & !(page_sz - 1);
    if libc::mprotect(
        page as *mut c_void,
        page_sz,
        libc::PROT_READ | libc::PROT_WRITE,
    ) != 0
    {
        let errno = last_errno();
        if debug_enabled() {
            eprintln!(
                "[ocicancel-intercept] rebind: mprotect RW failed errno={} page=0x{:x}",
                errno, page
            );
        }
        return Err(HookError::ProtectFailed { errno });
    }

    core::ptr::write_unaligned(ptr, value);

    if slot >= relro.0 && slot < relro.1
        && libc::mprotect(page as *mut c_void, page_sz, libc::PROT_READ) != 0
    {
        let errno = last_errno();
        core::ptr::write_unaligned(ptr, current);
        if debug_enabled() {
            eprintln!(
                "[ocicancel-intercept] rebind: mprotect R failed errno={} page=0x{:x}",
                errno, page
            );
        }
        return Err(HookError::ProtectFailed { errno });
    }
    Ok(current)
}

/// Put each slot back to its own previous value, last write first. Keeps
/// going past a failure and reports the first one.
unsafe fn restore_slots(
    writes: &[SlotWrite],
    page_sz: usize,
    relro: (usize, usize),
) -> Result<(), HookError> {
    let mut first_err = None;
    for write in writes.iter().rev() {
        if let Err(e) = write_slot(write.slot, write.previous, page_sz, relro) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Point every import slot of `want` in one image at `replacement`.
///
/// The returned rebinding is empty when the image imports no such symbol.
/// A failure part-way through puts back the slots already written.
unsafe fn rebind_in_image(
    linkage: &Linkage,
    want: &[u8],
    replacement: usize,
) -> Result<Rebinding, HookError> {
    let page_sz = page_size();
    let mut written: Vec<SlotWrite> = Vec::new();

    for (rel_ptr, rel_size) in linkage.tables {
        if rel_ptr.is_null() || rel_size == 0 {
            continue;
        }
        let nrels = rel_size / core::mem::size_of::<elf::Elf64Rela>();
        let rels = core::slice::from_raw_parts(rel_ptr, nrels);

        for rel in rels {
            if !rel.is_import_slot() || rel.sym() == 0 {
                continue;
            }
            let sym = &*linkage.symtab.add(rel.sym());
            let st_name = sym.st_name as usize;
            if st_name == 0 || (linkage.strsz != 0 && st_name >= linkage.strsz) {
                continue;
            }
            let name = CStr::from_ptr(linkage.strtab.add(st_name) as *const c_char);
            if name.to_bytes() != want {
                continue;
            }

            let slot = linkage.base + rel.r_offset as usize;
            match write_slot(slot, replacement, page_sz, linkage.relro) {
                Ok(previous) => written.push(SlotWrite { slot, previous }),
                Err(e) => {
                    let _ = restore_slots(&written, page_sz, linkage.relro);
                    return Err(e);
                }
            }
        }
    }

    Ok(Rebinding::new(written))
}

/// Rebind `symbol` as imported by one specific loaded module.
///
/// Only the GOT / PLT slots of `module` are touched; other images that
/// import the same symbol keep calling the real function.
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

    match linkage_at(module.base_address) {
        None => Err(HookError::ModuleNotLoaded(module.name.clone())),
        Some(None) => Err(HookError::InvalidImage(module.name.clone())),
        Some(Some(linkage)) => {
            let rebinding = rebind_in_image(&linkage, symbol.as_bytes(), replacement)?;
            if rebinding.is_empty() {
                return Err(HookError::SymbolNotFound {
                    module: module.name.clone(),
                    symbol: symbol.to_string(),
                });
            }
            Ok(rebinding)
        }
    }
}

/// Undo [`rebind_in_module`], slot by slot.
///
/// # Safety
/// `rebinding` must come from `rebind_in_module` on this same module.
pub unsafe fn restore_in_module(module: &ModuleInfo, rebinding: &Rebinding) -> Result<(), HookError> {
    match linkage_at(module.base_address) {
        None => Err(HookError::ModuleNotLoaded(module.name.clone())),
        Some(None) => Err(HookError::InvalidImage(module.name.clone())),
        Some(Some(linkage)) => restore_slots(rebinding.slots(), page_size(), linkage.relro),
    }
}
