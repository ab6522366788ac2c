// Best-effort stderr logging that never panics.
//
// GUI hosts on Windows may run without a console; `eprintln!` panics when the
// write fails there, so every diagnostic print in this workspace goes through
// this macro instead.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
