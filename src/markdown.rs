use iced::widget::{column, container, horizontal_rule, row, text, Column, Space};
use iced::{font, Element, Font, Length};
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag};

const BODY_SIZE: u16 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Heading(u8, String),
    Paragraph(String),
    Code { lang: Option<String>, code: String },
    ListItem { marker: String, depth: usize, text: String },
    Quote(String),
    Rule,
}

#[derive(Default)]
struct Builder {
    blocks: Vec<Block>,
    buf: String,
    lists: Vec<Option<u64>>,
    item: Option<(String, usize)>,
    quote_depth: usize,
    code_lang: Option<Option<String>>,
}

impl Builder {
    fn take(&mut self) -> String {
        std::mem::take(&mut self.buf).trim().to_string()
    }

    fn flush_item(&mut self) {
        if let Some((marker, depth)) = self.item.take() {
            let text = self.take();
            if !text.is_empty() {
                self.blocks.push(Block::ListItem { marker, depth, text });
            }
        }
    }

    fn start(&mut self, tag: Tag) {
        match tag {
            Tag::CodeBlock(kind) => {
                self.flush_item();
                let lang = match kind {
                    CodeBlockKind::Fenced(lang) if !lang.is_empty() => Some(lang.to_string()),
                    _ => None,
                };
                self.code_lang = Some(lang);
            }
            Tag::List(start) => {
                self.flush_item();
                self.lists.push(start);
            }
            Tag::Item => {
                self.flush_item();
                let depth = self.lists.len().saturating_sub(1);
                let marker = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let marker = format!("{}.", n);
                        *n += 1;
                        marker
                    }
                    _ => "•".to_string(),
                };
                self.item = Some((marker, depth));
            }
            Tag::BlockQuote => self.quote_depth += 1,
            _ => {}
        }
    }

    fn end(&mut self, tag: Tag) {
        match tag {
            Tag::Paragraph => {
                if self.item.is_some() {
                    self.buf.push('\n');
                } else {
                    let text = self.take();
                    if text.is_empty() {
                        return;
                    }
                    self.blocks.push(if self.quote_depth > 0 {
                        Block::Quote(text)
                    } else {
                        Block::Paragraph(text)
                    });
                }
            }
            Tag::Heading(level, ..) => {
                let text = self.take();
                self.blocks.push(Block::Heading(level as u8, text));
            }
            Tag::CodeBlock(_) => {
                let code = std::mem::take(&mut self.buf);
                let code = code.strip_suffix('\n').unwrap_or(&code).to_string();
                let lang = self.code_lang.take().flatten();
                self.blocks.push(Block::Code { lang, code });
            }
            Tag::Item => self.flush_item(),
            Tag::List(_) => {
                self.flush_item();
                self.lists.pop();
            }
            Tag::BlockQuote => self.quote_depth = self.quote_depth.saturating_sub(1),
            _ => {}
        }
    }
}

/// Lays out rendered markdown as display blocks.
pub fn parse(markdown: &str) -> Vec<Block> {
    let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;
    let mut b = Builder::default();

    for event in Parser::new_ext(markdown, options) {
        match event {
            Event::Start(tag) => b.start(tag),
            Event::End(tag) => b.end(tag),
            Event::Text(t) | Event::Code(t) | Event::Html(t) => b.buf.push_str(&t),
            Event::SoftBreak => {
                if b.code_lang.is_some() {
                    b.buf.push('\n');
                } else {
                    b.buf.push(' ');
                }
            }
            Event::HardBreak => b.buf.push('\n'),
            Event::Rule => b.blocks.push(Block::Rule),
            Event::TaskListMarker(done) => b.buf.push_str(if done { "[x] " } else { "[ ] " }),
            _ => {}
        }
    }

    // tight list items and stray text without a closing tag
    b.flush_item();
    let rest = b.take();
    if !rest.is_empty() {
        b.blocks.push(Block::Paragraph(rest));
    }
    b.blocks
}

fn bold() -> Font {
    Font { weight: font::Weight::Bold, ..Font::DEFAULT }
}

fn italic() -> Font {
    Font { style: font::Style::Italic, ..Font::DEFAULT }
}

pub fn view<'a, M: 'a>(blocks: &'a [Block]) -> Element<'a, M> {
    Column::with_children(blocks.iter().map(view_block))
        .spacing(8)
        .width(Length::Fill)
        .into()
}

fn view_block<'a, M: 'a>(block: &'a Block) -> Element<'a, M> {
    match block {
        Block::Heading(level, content) => {
            let size: u16 = match level {
                1 => 24,
                2 => 21,
                3 => 18,
                _ => 16,
            };
            text(content).size(size).font(bold()).into()
        }
        Block::Paragraph(content) => text(content).size(BODY_SIZE).into(),
        Block::Code { lang, code } => {
            let mut body = column![].spacing(4);
            if let Some(lang) = lang {
                body = body.push(text(lang).size(11).font(italic()));
            }
            body = body.push(text(code).size(14).font(Font::MONOSPACE));
            container(body)
                .padding(10)
                .width(Length::Fill)
                .style(container::rounded_box)
                .into()
        }
        Block::ListItem { marker, depth, text: content } => row![
            Space::with_width(Length::Fixed(18.0 * *depth as f32)),
            text(marker).size(BODY_SIZE),
            text(content).size(BODY_SIZE).width(Length::Fill),
        ]
        .spacing(6)
        .into(),
        Block::Quote(content) => container(text(content).size(BODY_SIZE).font(italic()))
            .padding([4, 12])
            .into(),
        Block::Rule => horizontal_rule(1).into(),
    }
}
