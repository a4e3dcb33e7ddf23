//! Markdown → Telegram plain text plus formatting entities.
//!
//! Telegram measures entity offsets in UTF-16 code units, so the writer keeps
//! a running UTF-16 length next to the text it builds.

use bridge_types::{EntityKind, MessageEntity};
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};

pub fn render_markdown(input: &str) -> (String, Vec<MessageEntity>) {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(input, options);
    let mut writer = EntityWriter::default();
    for event in parser {
        writer.handle(event);
    }
    writer.finish()
}

pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

#[derive(Default)]
struct EntityWriter {
    text: String,
    utf16: usize,
    entities: Vec<MessageEntity>,
    open: Vec<OpenEntity>,
    list_stack: Vec<ListState>,
    // block separators are held back until more content arrives, so the
    // output never ends in blank lines and no entity swallows them
    pending_breaks: usize,
}

struct OpenEntity {
    kind: EntityKind,
    offset: usize,
    url: Option<String>,
    language: Option<String>,
}

#[derive(Clone, Copy)]
enum ListState {
    Bullet,
    Ordered(u64),
}

impl EntityWriter {
    fn handle(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) => self.push_text(&text),
            Event::Code(code) => {
                self.open(EntityKind::Code, None, None);
                self.push_text(&code);
                self.close(EntityKind::Code);
            }
            Event::SoftBreak | Event::HardBreak => self.push_text("\n"),
            Event::Rule => {
                self.block_break();
                self.push_text("———");
            }
            Event::Html(html) | Event::InlineHtml(html) => self.push_text(&html),
            Event::TaskListMarker(done) => self.push_text(if done { "[x] " } else { "[ ] " }),
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph => self.block_break(),
            Tag::Heading { .. } => {
                self.block_break();
                self.open(EntityKind::Bold, None, None);
            }
            Tag::BlockQuote => {
                self.block_break();
                self.open(EntityKind::Blockquote, None, None);
            }
            Tag::CodeBlock(kind) => {
                self.block_break();
                let language = match kind {
                    CodeBlockKind::Fenced(lang) => {
                        let lang = lang.split_whitespace().next().unwrap_or("");
                        (!lang.is_empty()).then(|| lang.to_string())
                    }
                    CodeBlockKind::Indented => None,
                };
                self.open(EntityKind::Pre, None, language);
            }
            Tag::List(start) => {
                if self.list_stack.is_empty() {
                    self.block_break();
                } else {
                    self.line_break();
                }
                self.list_stack.push(match start {
                    Some(n) => ListState::Ordered(n),
                    None => ListState::Bullet,
                });
            }
            Tag::Item => {
                self.line_break();
                let depth = self.list_stack.len().saturating_sub(1);
                let marker = match self.list_stack.last_mut() {
                    Some(ListState::Ordered(n)) => {
                        let marker = format!("{n}. ");
                        *n += 1;
                        marker
                    }
                    _ => "• ".to_string(),
                };
                self.push_text(&format!("{}{marker}", "  ".repeat(depth)));
            }
            Tag::Emphasis => self.open(EntityKind::Italic, None, None),
            Tag::Strong => self.open(EntityKind::Bold, None, None),
            Tag::Strikethrough => self.open(EntityKind::Strikethrough, None, None),
            Tag::Link { dest_url, .. } => {
                self.open(EntityKind::TextLink, Some(dest_url.to_string()), None)
            }
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Heading(_) => self.close(EntityKind::Bold),
            TagEnd::BlockQuote => self.close(EntityKind::Blockquote),
            TagEnd::CodeBlock => {
                self.trim_trailing_newlines();
                self.close(EntityKind::Pre);
            }
            TagEnd::List(_) => {
                self.list_stack.pop();
            }
            TagEnd::Emphasis => self.close(EntityKind::Italic),
            TagEnd::Strong => self.close(EntityKind::Bold),
            TagEnd::Strikethrough => self.close(EntityKind::Strikethrough),
            TagEnd::Link => self.close(EntityKind::TextLink),
            _ => {}
        }
    }

    fn block_break(&mut self) {
        let wanted = if self.list_stack.is_empty() { 2 } else { 1 };
        self.request_breaks(wanted);
    }

    fn line_break(&mut self) {
        self.request_breaks(1);
    }

    fn request_breaks(&mut self, count: usize) {
        if !self.text.is_empty() {
            self.pending_breaks = self.pending_breaks.max(count);
        }
    }

    fn flush_breaks(&mut self) {
        for _ in 0..std::mem::take(&mut self.pending_breaks) {
            self.text.push('\n');
            self.utf16 += 1;
        }
    }

    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.flush_breaks();
        self.text.push_str(text);
        self.utf16 += utf16_len(text);
    }

    fn trim_trailing_newlines(&mut self) {
        let floor = self.open.last().map(|open| open.offset).unwrap_or(0);
        while self.utf16 > floor && self.text.ends_with('\n') {
            self.text.pop();
            self.utf16 -= 1;
        }
    }

    fn open(&mut self, kind: EntityKind, url: Option<String>, language: Option<String>) {
        self.flush_breaks();
        self.open.push(OpenEntity {
            kind,
            offset: self.utf16,
            url,
            language,
        });
    }

    fn close(&mut self, kind: EntityKind) {
        let Some(idx) = self.open.iter().rposition(|open| open.kind == kind) else {
            return;
        };
        let open = self.open.remove(idx);
        self.emit(open);
    }

    fn emit(&mut self, open: OpenEntity) {
        let length = self.utf16.saturating_sub(open.offset);
        if length == 0 {
            return;
        }
        let mut entity = MessageEntity::new(open.kind, open.offset, length);
        entity.url = open.url;
        entity.language = open.language;
        self.entities.push(entity);
    }

    fn finish(mut self) -> (String, Vec<MessageEntity>) {
        while let Some(open) = self.open.pop() {
            self.emit(open);
        }
        self.entities.sort_by_key(|entity| entity.offset);
        (self.text, self.entities)
    }
}
