use everfall::catalog::{CreatureTemplate, SpellTemplate, YamlCatalog};
use std::path::Path;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: content_validate <data-root>");
        std::process::exit(2);
    }
    let root = Path::new(&args[1]);

    let mut errors = 0usize;
    let creatures = validate_dir::<CreatureTemplate>(&YamlCatalog::creature_dir(root), &mut errors);
    let spells = validate_dir::<SpellTemplate>(&YamlCatalog::spell_dir(root), &mut errors);

    println!("content_validate: {}", root.display());
    println!("- creature templates parsed: {}", creatures);
    println!("- spell templates parsed: {}", spells);
    println!("- errors: {}", errors);
    if errors > 0 {
        std::process::exit(1);
    }
}

fn validate_dir<T: serde::de::DeserializeOwned>(dir: &Path, errors: &mut usize) -> usize {
    let mut parsed = 0usize;
    let Ok(entries) = std::fs::read_dir(dir) else {
        println!("- missing directory: {}", dir.display());
        return 0;
    };
    let mut paths: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "yaml").unwrap_or(false))
        .collect();
    paths.sort();
    for path in paths {
        let stem_ok = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.parse::<u32>().is_ok())
            .unwrap_or(false);
        if !stem_ok {
            eprintln!("{}: file name is not a template id", path.display());
            *errors += 1;
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_yaml::from_str::<T>(&contents) {
                Ok(_) => parsed += 1,
                Err(err) => {
                    eprintln!("{}: {}", path.display(), err);
                    *errors += 1;
                }
            },
            Err(err) => {
                eprintln!("{}: {}", path.display(), err);
                *errors += 1;
            }
        }
    }
    parsed
}
