use std::ffi::CString;
use std::io;

use anyhow::Context;
use tracing::{debug, info};

use crate::config::ServiceSettings;

/// 未配置 runas_user 时使用的账户
const DEFAULT_RUNAS_USER: &str = "nobody";

/// getpwnam_r / getgrnam_r 的初始缓冲区，ERANGE 时翻倍
const INITIAL_BUF_LEN: usize = 1024;
const MAX_BUF_LEN: usize = 1 << 20;

/// 以 root 运行时切换到非特权账户：清空附加组，setgid，setuid，umask 077。
/// 必须在所有监听 socket 绑定之后调用；非 root 时什么也不做。
pub fn drop_privileges(settings: &ServiceSettings) -> anyhow::Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        debug!(target = "privileges", "not running as root, keeping current identity");
        return Ok(());
    }

    let user = settings.runas_user.as_deref().unwrap_or(DEFAULT_RUNAS_USER);
    let (uid, user_gid) = lookup_user(user)?;
    let gid = match settings.runas_group.as_deref() {
        Some(group) => lookup_group(group)?,
        None => user_gid,
    };

    // 顺序固定：setuid 之后将无权再修改组
    if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
        return Err(io::Error::last_os_error()).context("setgroups([])");
    }
    if unsafe { libc::setgid(gid) } != 0 {
        return Err(io::Error::last_os_error()).with_context(|| format!("setgid({gid})"));
    }
    if unsafe { libc::setuid(uid) } != 0 {
        return Err(io::Error::last_os_error()).with_context(|| format!("setuid({uid})"));
    }
    unsafe { libc::umask(0o077) };

    info!(target = "privileges", user = %user, uid, gid, "dropped root privileges");
    Ok(())
}

/// 用户名 -> (uid, 主组 gid)
fn lookup_user(name: &str) -> anyhow::Result<(libc::uid_t, libc::gid_t)> {
    let cname = CString::new(name).with_context(|| format!("invalid user name {name:?}"))?;
    let mut buf_len = INITIAL_BUF_LEN;
    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; buf_len];
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(cname.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf_len < MAX_BUF_LEN {
            buf_len *= 2;
            continue;
        }
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc)).with_context(|| format!("look up user {name}"));
        }
        if result.is_null() {
            anyhow::bail!("unknown user {name}");
        }
        return Ok((pwd.pw_uid, pwd.pw_gid));
    }
}

fn lookup_group(name: &str) -> anyhow::Result<libc::gid_t> {
    let cname = CString::new(name).with_context(|| format!("invalid group name {name:?}"))?;
    let mut buf_len = INITIAL_BUF_LEN;
    loop {
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut buf = vec![0 as libc::c_char; buf_len];
        let mut result: *mut libc::group = std::ptr::null_mut();
        let rc = unsafe {
            libc::getgrnam_r(cname.as_ptr(), &mut grp, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf_len < MAX_BUF_LEN {
            buf_len *= 2;
            continue;
        }
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc)).with_context(|| format!("look up group {name}"));
        }
        if result.is_null() {
            anyhow::bail!("unknown group {name}");
        }
        return Ok(grp.gr_gid);
    }
}
