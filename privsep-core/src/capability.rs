//! Linux capability bit twiddling: `capset`/`capget`/`prctl(PR_SET_KEEPCAPS)`.
//!
//! The kernel's `capset`/`capget` ABI (version 2) packs each of the three
//! capability sets (effective, permitted, inheritable) as two 32-bit words —
//! capabilities 0..31 in the low word, 32..63 in the high word. There is no
//! safe wrapper for this pair of syscalls in `nix` or `libc`, so this module
//! issues them directly, mirroring the struct layout a C caller would use.

use std::io;

use crate::error::PrivsepError;

const LINUX_CAPABILITY_VERSION_2: u32 = 0x2007_1026;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// One capability bit, named after the kernel's `CAP_*` constants as of the
/// 4.11 `include/uapi/linux/capability.h`. New capabilities added by later
/// kernels are not represented here; callers that need one can still pass its
/// raw index to [`drop_all_caps_except`] and friends since those take `u8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CapabilityName {
    Chown = 0,
    DacOverride = 1,
    DacReadSearch = 2,
    Fowner = 3,
    Fsetid = 4,
    Kill = 5,
    Setgid = 6,
    Setuid = 7,
    Setpcap = 8,
    LinuxImmutable = 9,
    NetBindService = 10,
    NetBroadcast = 11,
    NetAdmin = 12,
    NetRaw = 13,
    IpcLock = 14,
    IpcOwner = 15,
    SysModule = 16,
    SysRawio = 17,
    SysChroot = 18,
    SysPtrace = 19,
    SysPacct = 20,
    SysAdmin = 21,
    SysBoot = 22,
    SysNice = 23,
    SysResource = 24,
    SysTime = 25,
    SysTtyConfig = 26,
    Mknod = 27,
    Lease = 28,
    AuditWrite = 29,
    AuditControl = 30,
    Setfcap = 31,
    MacOverride = 32,
    MacAdmin = 33,
    Syslog = 34,
    WakeAlarm = 35,
    BlockSuspend = 36,
    AuditRead = 37,
}

impl CapabilityName {
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Looks a capability up by its kernel name, e.g. `"CAP_NET_RAW"` or
    /// `"CAP_SYS_ADMIN"` (case-insensitive, `CAP_` prefix optional).
    pub fn from_name(name: &str) -> Option<Self> {
        let trimmed = name.trim_start_matches("CAP_").to_ascii_uppercase();
        use CapabilityName::*;
        Some(match trimmed.as_str() {
            "CHOWN" => Chown,
            "DAC_OVERRIDE" => DacOverride,
            "DAC_READ_SEARCH" => DacReadSearch,
            "FOWNER" => Fowner,
            "FSETID" => Fsetid,
            "KILL" => Kill,
            "SETGID" => Setgid,
            "SETUID" => Setuid,
            "SETPCAP" => Setpcap,
            "LINUX_IMMUTABLE" => LinuxImmutable,
            "NET_BIND_SERVICE" => NetBindService,
            "NET_BROADCAST" => NetBroadcast,
            "NET_ADMIN" => NetAdmin,
            "NET_RAW" => NetRaw,
            "IPC_LOCK" => IpcLock,
            "IPC_OWNER" => IpcOwner,
            "SYS_MODULE" => SysModule,
            "SYS_RAWIO" => SysRawio,
            "SYS_CHROOT" => SysChroot,
            "SYS_PTRACE" => SysPtrace,
            "SYS_PACCT" => SysPacct,
            "SYS_ADMIN" => SysAdmin,
            "SYS_BOOT" => SysBoot,
            "SYS_NICE" => SysNice,
            "SYS_RESOURCE" => SysResource,
            "SYS_TIME" => SysTime,
            "SYS_TTY_CONFIG" => SysTtyConfig,
            "MKNOD" => Mknod,
            "LEASE" => Lease,
            "AUDIT_WRITE" => AuditWrite,
            "AUDIT_CONTROL" => AuditControl,
            "SETFCAP" => Setfcap,
            "MAC_OVERRIDE" => MacOverride,
            "MAC_ADMIN" => MacAdmin,
            "SYSLOG" => Syslog,
            "WAKE_ALARM" => WakeAlarm,
            "BLOCK_SUSPEND" => BlockSuspend,
            "AUDIT_READ" => AuditRead,
            _ => return None,
        })
    }
}

/// Packs capability bit indices into a 64-bit mask.
fn caps_to_mask(caps: &[u8]) -> u64 {
    caps.iter().fold(0u64, |mask, &bit| mask | (1u64 << bit))
}

/// Unpacks a 64-bit mask into its set bit indices, in ascending order.
fn mask_to_caps(mask: u64) -> Vec<u8> {
    (0..64).filter(|bit| (mask >> bit) & 1 == 1).collect()
}

fn split_mask(mask: u64) -> (u32, u32) {
    (mask as u32, (mask >> 32) as u32)
}

fn join_mask(low: u32, high: u32) -> u64 {
    (low as u64) | ((high as u64) << 32)
}

fn errno_error(context: &'static str) -> PrivsepError {
    PrivsepError::Capability {
        context,
        source: io::Error::last_os_error(),
    }
}

/// Sets or clears the calling thread's `SECBIT_KEEP_CAPS` flag via
/// `prctl(PR_SET_KEEPCAPS, ...)`. Needed between a `setuid` that would
/// otherwise clear all capability sets and the subsequent
/// [`drop_all_caps_except`] call that restores only the wanted subset.
pub fn set_keepcaps(enable: bool) -> Result<(), PrivsepError> {
    let ret = unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, enable as libc::c_ulong, 0, 0, 0) };
    if ret != 0 {
        return Err(errno_error("prctl(PR_SET_KEEPCAPS)"));
    }
    Ok(())
}

/// Replaces the effective/permitted/inheritable capability sets wholesale
/// with exactly the capabilities named, dropping everything else.
pub fn drop_all_caps_except(
    effective: &[u8],
    permitted: &[u8],
    inheritable: &[u8],
) -> Result<(), PrivsepError> {
    let (eff_lo, eff_hi) = split_mask(caps_to_mask(effective));
    let (prm_lo, prm_hi) = split_mask(caps_to_mask(permitted));
    let (inh_lo, inh_hi) = split_mask(caps_to_mask(inheritable));

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_2,
        pid: 0,
    };
    let mut data = [
        CapUserData {
            effective: eff_lo,
            permitted: prm_lo,
            inheritable: inh_lo,
        },
        CapUserData {
            effective: eff_hi,
            permitted: prm_hi,
            inheritable: inh_hi,
        },
    ];

    let ret = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if ret != 0 {
        return Err(errno_error("capset"));
    }
    Ok(())
}

/// Reads back the calling process's current (effective, permitted,
/// inheritable) capability sets as lists of bit indices.
pub fn get_caps() -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), PrivsepError> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_2,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];

    let ret = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &header as *const CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if ret != 0 {
        return Err(errno_error("capget"));
    }

    Ok((
        mask_to_caps(join_mask(data[0].effective, data[1].effective)),
        mask_to_caps(join_mask(data[0].permitted, data[1].permitted)),
        mask_to_caps(join_mask(data[0].inheritable, data[1].inheritable)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_to_mask_matches_known_vector() {
        // 17 = CAP_SYS_RAWIO, 49 is out of the original 38-capability range
        // but still a legal bit index: sets bit 17 of both the low and high
        // 32-bit words.
        let mask = caps_to_mask(&[17, 49]);
        assert_eq!(mask, 0x0002_0000_0002_0000);
        let (lo, hi) = split_mask(mask);
        assert_eq!(lo, 0x0002_0000);
        assert_eq!(hi, 0x0002_0000);
    }

    #[test]
    fn mask_to_caps_round_trips() {
        let caps = vec![0u8, 5, 31, 32, 63];
        let mask = caps_to_mask(&caps);
        let mut back = mask_to_caps(mask);
        back.sort_unstable();
        assert_eq!(back, caps);
    }

    #[test]
    fn empty_set_is_zero_mask() {
        assert_eq!(caps_to_mask(&[]), 0);
        assert!(mask_to_caps(0).is_empty());
    }

    #[test]
    fn from_name_accepts_prefixed_and_bare() {
        assert_eq!(
            CapabilityName::from_name("CAP_NET_RAW"),
            Some(CapabilityName::NetRaw)
        );
        assert_eq!(
            CapabilityName::from_name("sys_admin"),
            Some(CapabilityName::SysAdmin)
        );
        assert_eq!(CapabilityName::from_name("not_a_cap"), None);
    }

    #[test]
    fn index_matches_kernel_numbering() {
        assert_eq!(CapabilityName::Chown.index(), 0);
        assert_eq!(CapabilityName::AuditRead.index(), 37);
    }
}
