mod assets;
mod config;
mod dispatch;
mod error;
mod markdown;
mod normalize;
mod render;
mod session;

use iced::{
    alignment, clipboard, font,
    widget::{
        button, column, container, horizontal_rule, pick_list, row, scrollable, text, text_input,
        text_input::Id, Space,
    },
    window, Element, Font, Length, Padding, Subscription, Task, Theme, time,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::{Config, UiConfig};
use dispatch::{Dispatcher, RawResponse};
use error::ChatError;
use markdown::Block;
use session::{Author, MessageKind, Session};

const ABOUT: &str = "This Medical AI Bot provides general medical information and guidance. \
Always consult with qualified healthcare professionals for medical advice, diagnosis, or treatment.";

const CAN_HELP_WITH: [&str; 5] = [
    "General medical information",
    "Symptom explanations",
    "Health and wellness tips",
    "Medication information",
    "Medical terminology",
];

const DISCLAIMERS: [&str; 4] = [
    "Not a substitute for professional medical advice",
    "Always consult healthcare providers for diagnosis",
    "Don't rely solely on AI for medical decisions",
    "Seek immediate help for emergencies",
];

const TIP: &str = "💡 Tip: Start by typing your medical question or health concern in the box below!";

const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn init_tracing() {
    let filter = EnvFilter::try_from_env("MEDBOT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn,medbot=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> iced::Result {
    // .env is optional; a real environment variable wins either way
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = Config::load();
    let window_config = config.window.clone();

    iced::application(App::title, App::update, App::view)
        .theme(App::theme)
        .subscription(App::subscription)
        .window(window::Settings {
            size: iced::Size::new(window_config.width as f32, window_config.height as f32),
            min_size: Some(iced::Size::new(
                window_config.min_width as f32,
                window_config.min_height as f32,
            )),
            position: window::Position::Centered,
            ..Default::default()
        })
        .run_with(move || App::new(config))
}

#[derive(Debug, Clone)]
enum Message {
    InputChanged(String),
    Submit,
    ReplyReceived(u64, Result<RawResponse, ChatError>),
    ModelSelected(String),
    Reset,
    Tick,
    CopyLastReply,
}

/// Shown instead of the chat when startup requirements are missing.
struct Blocked {
    diagnostic: String,
    hint: Option<String>,
}

struct App {
    ui: UiConfig,
    session: Session,
    dispatcher: Option<Arc<Dispatcher>>,
    blocked: Option<Blocked>,
    models: Vec<String>,
    selected_model: Option<String>,
    input_text: String,
    loading_frame: usize,
    rendered: Vec<Vec<Block>>,
    rendered_revision: Option<u64>,
    logo: Option<iced::widget::image::Handle>,
    input_id: Id,
    scroll_id: scrollable::Id,
}

impl App {
    fn new(config: Config) -> (Self, Task<Message>) {
        let (dispatcher, blocked) = match config.resolve_api_key() {
            Ok(api_key) => match Dispatcher::from_config(&config, api_key) {
                Ok(dispatcher) => (Some(Arc::new(dispatcher)), None),
                Err(e) => {
                    error!("could not set up backend: {}", e);
                    (None, Some(Blocked { diagnostic: e.to_string(), hint: None }))
                }
            },
            Err(diagnostic) => {
                error!("{}", diagnostic);
                (None, Some(Blocked { diagnostic, hint: config.api_key_hint() }))
            }
        };

        let models = dispatcher
            .as_ref()
            .map(|d| d.models().to_vec())
            .unwrap_or_default();

        let logo = config.logo_path().and_then(|path| assets::load_logo(&path)).map(|logo| {
            iced::widget::image::Handle::from_rgba(logo.width, logo.height, logo.rgba)
        });

        info!(
            blocked = blocked.is_some(),
            models = models.len(),
            "chat screen ready"
        );

        let input_id = Id::unique();
        let mut app = App {
            session: Session::new(config.ui.welcome_message.clone()),
            ui: config.ui,
            dispatcher,
            blocked,
            selected_model: models.first().cloned(),
            models,
            input_text: String::new(),
            loading_frame: 0,
            rendered: Vec::new(),
            rendered_revision: None,
            logo,
            input_id: input_id.clone(),
            scroll_id: scrollable::Id::unique(),
        };
        app.sync_rendered();

        (app, text_input::focus(input_id))
    }

    fn title(&self) -> String {
        self.ui.title.clone()
    }

    fn can_submit(&self) -> bool {
        self.dispatcher.is_some() && !self.session.is_pending()
    }

    /// Re-renders the transcript when the session changed since the last pass.
    fn sync_rendered(&mut self) -> bool {
        let revision = self.session.revision();
        if self.rendered_revision == Some(revision) {
            return false;
        }
        self.rendered = self
            .session
            .messages()
            .iter()
            .map(|m| {
                let formatted = render::render_with(m.content(), self.ui.hard_line_breaks);
                markdown::parse(&formatted)
            })
            .collect();
        self.rendered_revision = Some(revision);
        true
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        let task = self.handle(message);
        if self.sync_rendered() {
            let snap = scrollable::snap_to(self.scroll_id.clone(), scrollable::RelativeOffset::END);
            Task::batch([task, snap])
        } else {
            task
        }
    }

    fn handle(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::InputChanged(value) => {
                self.input_text = value;
                Task::none()
            }
            Message::Submit => {
                let Some(dispatcher) = self.dispatcher.clone() else {
                    return Task::none();
                };
                let Some(turn) = self.session.begin_turn(&self.input_text, Some(self.ui.user_name.as_str()))
                else {
                    return Task::none();
                };

                self.input_text.clear();
                self.loading_frame = 0;
                let context = self.session.context();
                let model = self.selected_model.clone();

                Task::future(async move {
                    let outcome = dispatcher.dispatch(&context, &turn.query, model.as_deref()).await;
                    Message::ReplyReceived(turn.id, outcome)
                })
            }
            Message::ReplyReceived(turn_id, outcome) => {
                match self.session.finish_turn(turn_id, outcome, Some(self.ui.bot_name.as_str())) {
                    Some(_) => text_input::focus(self.input_id.clone()),
                    None => Task::none(),
                }
            }
            Message::ModelSelected(model) => {
                info!(%model, "model selected");
                self.selected_model = Some(model);
                Task::none()
            }
            Message::Reset => {
                self.session.reset();
                text_input::focus(self.input_id.clone())
            }
            Message::Tick => {
                if self.session.is_pending() {
                    self.loading_frame = (self.loading_frame + 1) % SPINNER.len();
                }
                Task::none()
            }
            Message::CopyLastReply => match self.last_reply() {
                Some(reply) => clipboard::write(reply.to_string()),
                None => Task::none(),
            },
        }
    }

    fn last_reply(&self) -> Option<&str> {
        self.session
            .messages()
            .iter()
            .rev()
            .find(|m| m.author() == Author::Bot && m.kind() == MessageKind::Reply)
            .map(|m| m.content())
    }

    fn subscription(&self) -> Subscription<Message> {
        if self.session.is_pending() {
            time::every(Duration::from_millis(80)).map(|_| Message::Tick)
        } else {
            Subscription::none()
        }
    }

    fn view(&self) -> Element<Message> {
        let header = column![
            text(&self.ui.title).size(28).font(bold()),
            text(&self.ui.subtitle).size(14).font(italic()),
        ]
        .spacing(4);

        let body: Element<Message> = match &self.blocked {
            Some(blocked) => self.view_blocked(blocked),
            None => self.view_chat(),
        };

        let main = column![header, horizontal_rule(1), body, self.view_input()]
            .spacing(10)
            .padding(15)
            .width(Length::Fill)
            .height(Length::Fill);

        container(row![self.view_sidebar(), main])
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn view_sidebar(&self) -> Element<Message> {
        let mut sidebar = column![
            text("About").size(20).font(bold()),
            text(ABOUT).size(13),
            Space::with_height(Length::Fixed(10.0)),
            text("Settings").size(20).font(bold()),
        ]
        .spacing(8);

        if !self.models.is_empty() {
            sidebar = sidebar.push(text("Model").size(13)).push(
                pick_list(
                    self.models.as_slice(),
                    self.selected_model.as_ref(),
                    Message::ModelSelected,
                )
                .width(Length::Fill),
            );
        }

        sidebar = sidebar.push(
            button(text("🗑 Clear conversation").size(14))
                .on_press(Message::Reset)
                .padding(10)
                .width(Length::Fill),
        );

        container(sidebar)
            .padding(15)
            .width(Length::Fixed(260.0))
            .height(Length::Fill)
            .style(container::rounded_box)
            .into()
    }

    fn view_blocked<'a>(&'a self, blocked: &'a Blocked) -> Element<'a, Message> {
        let mut panel = column![text(format!("⚠️ {}", blocked.diagnostic)).size(16).style(text::danger)]
            .spacing(8);
        if let Some(hint) = &blocked.hint {
            panel = panel.push(text(hint).size(14));
        }
        container(panel)
            .padding(20)
            .width(Length::Fill)
            .height(Length::Fill)
            .into()
    }

    fn view_welcome(&self) -> Element<Message> {
        let bullets = |title: &'static str, items: &'static [&'static str]| {
            let mut col = column![text(title).size(18).font(bold())].spacing(4);
            for item in items {
                col = col.push(text(format!("• {}", item)).size(14));
            }
            col.width(Length::FillPortion(1))
        };

        let mut welcome = column![].spacing(12);
        if let Some(logo) = &self.logo {
            welcome = welcome.push(iced::widget::image(logo.clone()).width(Length::Fixed(96.0)));
        }
        welcome
            .push(text(format!("👋 Welcome to {}", self.ui.title)).size(22).font(bold()))
            .push(
                row![
                    bullets("What I can help with:", &CAN_HELP_WITH),
                    bullets("Important disclaimers:", &DISCLAIMERS),
                ]
                .spacing(20),
            )
            .push(horizontal_rule(1))
            .push(text(TIP).size(14))
            .into()
    }

    fn view_chat(&self) -> Element<Message> {
        let mut transcript = column![].spacing(12).padding(Padding::from([0, 10]));

        if !self.session.has_user_turns() {
            transcript = transcript.push(self.view_welcome());
        }

        for (message, blocks) in self.session.messages().iter().zip(&self.rendered) {
            let name = text(message.display_name()).size(13).font(bold());
            let name = if message.kind() == MessageKind::Notice {
                name.style(text::danger)
            } else {
                name
            };

            let bubble = container(column![name, markdown::view(blocks)].spacing(6))
                .padding(12)
                .width(Length::Fill);
            let bubble = match message.author() {
                Author::User => bubble.style(container::bordered_box),
                Author::Bot => bubble.style(container::rounded_box),
            };
            transcript = transcript.push(bubble);
        }

        if self.session.is_pending() {
            transcript = transcript.push(
                row![
                    text(SPINNER[self.loading_frame % SPINNER.len()]).size(20),
                    text("Thinking...").size(14),
                ]
                .spacing(10)
                .align_y(alignment::Vertical::Center),
            );
        }

        scrollable(transcript)
            .id(self.scroll_id.clone())
            .height(Length::Fill)
            .into()
    }

    fn view_input(&self) -> Element<Message> {
        let mut input = text_input(&self.ui.placeholder, &self.input_text)
            .padding(12)
            .size(16)
            .id(self.input_id.clone());
        if self.can_submit() {
            input = input
                .on_input(Message::InputChanged)
                .on_submit(Message::Submit);
        }

        let send = button(text("Send").size(16))
            .padding(12)
            .on_press_maybe(self.can_submit().then_some(Message::Submit));

        let mut bar = row![input, send].spacing(8).align_y(alignment::Vertical::Center);

        if self.last_reply().is_some() && !self.session.is_pending() {
            bar = bar.push(
                button(text("[Copy]").size(14))
                    .on_press(Message::CopyLastReply)
                    .padding(12),
            );
        }

        bar.into()
    }

    fn theme(&self) -> Theme {
        Theme::TokyoNight
    }
}

fn bold() -> Font {
    Font { weight: font::Weight::Bold, ..Font::DEFAULT }
}

fn italic() -> Font {
    Font { style: font::Style::Italic, ..Font::DEFAULT }
}
