//! Inspect command

use std::path::Path;

use haiku_poet::{ModelFile, Vocabulary};

pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let model = ModelFile::load(path)?;
    let vocabulary = Vocabulary::new(&model.spec.vocabulary)?;

    println!("Model: {}", path.display());
    println!("  Format:     v{}", model.version);
    println!("  Vocabulary: {} symbols", vocabulary.len());
    println!("              \"{}\"", vocabulary);
    match &model.digest {
        Some(digest) => println!("  Digest:     {digest}"),
        None => println!("  Digest:     none"),
    }

    println!();
    println!("Layers:");
    for (index, shape) in model.spec.shapes()?.iter().enumerate() {
        println!(
            "  {index:>2}. {:<8} {:<10} {:>5} → {:<5}",
            shape.kind,
            shape.name.as_deref().unwrap_or("-"),
            shape.input,
            shape.output
        );
    }

    println!();
    println!("Tensors:");
    let mut parameters = 0;
    for (name, tensor) in &model.tensors {
        parameters += tensor.len();
        println!("  {name:<20} {:?}", tensor.shape);
    }
    println!("  {parameters} parameters");

    Ok(())
}
