use std::fs;
use std::io::Write;
use std::path::Path;

/// 扫描 migrations/ 目录，把 SQL 文件按编号顺序嵌入编译产物。
///
/// 文件名必须形如 `NNN_description.sql`，运行时由
/// waveguard_schema_migrations 表按名字去重执行。
fn main() {
    println!("cargo:rerun-if-changed=migrations/");

    let out_dir = std::env::var("OUT_DIR").expect("OUT_DIR 未设置");
    let dest_path = Path::new(&out_dir).join("migrations.rs");

    let mut names: Vec<String> = Vec::new();
    let migrations_dir = Path::new("migrations");
    if migrations_dir.exists() {
        for entry in fs::read_dir(migrations_dir).expect("无法读取 migrations 目录") {
            let entry = entry.expect("无法读取 migrations 目录项");
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(name) = file_name.strip_suffix(".sql") else {
                continue;
            };
            // 编号前缀决定执行顺序，缺失时直接拒绝编译
            assert!(
                name.split('_').next().is_some_and(|p| {
                    p.len() == 3 && p.chars().all(|c| c.is_ascii_digit())
                }),
                "迁移文件名需要 NNN_ 编号前缀: {file_name}"
            );
            names.push(name.to_string());
        }
    }
    names.sort();

    let entries: Vec<String> = names
        .iter()
        .map(|name| {
            format!(
                "    (\"{name}\", include_str!(concat!(env!(\"CARGO_MANIFEST_DIR\"), \"/migrations/{name}.sql\")))",
            )
        })
        .collect();

    let mut f = fs::File::create(&dest_path).expect("无法创建 migrations.rs");
    writeln!(
        f,
        "/// 编译时扫描 migrations/ 目录生成，按 NNN_ 编号升序排列\n\
         pub const MIGRATIONS: &[(&str, &str)] = &[\n{}\n];",
        entries.join(",\n")
    )
    .expect("无法写入 migrations.rs");
}
