mod key_press;
mod send_text;
mod show;
mod type_text;
mod wait;

pub use key_press::KeyPress;
pub use send_text::{SendLine, SendText};
pub use show::Show;
pub use type_text::TypeText;
pub use wait::Wait;
