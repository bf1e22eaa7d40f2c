//! `fastrag notes` — Note management commands.
//!
//! Notes are embedded the next time `serve` or `ask` starts.

use fastrag_config::AppConfig;
use fastrag_core::message::OwnerId;
use fastrag_core::note::Note;
use fastrag_gateway::open_stores;

fn load_persistent_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if config.storage.backend == "memory" {
        return Err("storage.backend is \"memory\"; notes would be lost on exit".into());
    }
    Ok(config)
}

pub async fn list(owner: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_persistent_config()?;
    let (_, notes) = open_stores(&config).await?;

    let notes = notes.list_notes(&OwnerId::from(owner)).await?;
    if notes.is_empty() {
        println!("No notes for {owner}.");
        return Ok(());
    }

    for note in &notes {
        let body: String = note.body.chars().take(80).collect();
        println!("{}  {}", note.note_id, note.title);
        println!("      {body}");
        if !note.tags.is_empty() {
            println!("      tags: {}", note.tags.join(", "));
        }
        if let Some(url) = &note.url {
            println!("      url: {url}");
        }
    }
    println!();
    println!("{} note(s)", notes.len());
    Ok(())
}

pub async fn add(
    owner: &str,
    title: &str,
    body: &str,
    tags: Vec<String>,
    url: Option<String>,
    comments: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if title.trim().is_empty() && body.trim().is_empty() {
        return Err("a note needs a title or a body".into());
    }
    let config = load_persistent_config()?;
    let (_, notes) = open_stores(&config).await?;

    let tags = tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let mut note = Note::new(OwnerId::from(owner), title, body).with_tags(tags);
    if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
        note = note.with_url(url);
    }
    if let Some(comments) = comments.filter(|c| !c.trim().is_empty()) {
        note = note.with_comments(comments);
    }
    let note = notes.create_note(note).await?;
    println!("Created note {}", note.note_id);
    Ok(())
}

pub async fn delete(note_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_persistent_config()?;
    let (_, notes) = open_stores(&config).await?;

    let note = notes.delete_note(note_id).await?;
    println!("Deleted note {} ({})", note.note_id, note.title);
    Ok(())
}
