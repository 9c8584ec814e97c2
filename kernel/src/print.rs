// Print macros for kernel text output. Output lands on whichever video
// page the active terminal owns; see terminal::console.

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::terminal::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
