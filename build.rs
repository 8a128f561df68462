use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=Cargo.toml");

    // --version 里显示构建时间，工作区不一定是 git 仓库，只取构建信息
    EmitBuilder::builder()
        .build_timestamp()
        .emit()?;
    Ok(())
}
