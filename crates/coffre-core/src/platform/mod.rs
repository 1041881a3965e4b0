pub mod paths;
pub mod shell;

/// Return the system hostname, or `"unknown"` if it cannot be determined.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // Safety: gethostname writes at most buf.len() bytes and NUL-terminates
    // on every platform we build for.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".into();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
