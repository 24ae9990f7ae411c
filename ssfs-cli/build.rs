use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only cargo metadata; git metadata isn't available when the crate is built from crates.io by
    // `cargo install`
    EmitBuilder::builder().all_cargo().emit()?;

    Ok(())
}
