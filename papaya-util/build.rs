//! Compile time configurations for the util crate
fn main() {
    // the PAPAYA_PKG_NAME variable names the folder under `~/.config`.
    // Changing it orphans any credentials persisted by a previous install.
    println!("cargo::rustc-env=PAPAYA_PKG_NAME=papaya");
}
