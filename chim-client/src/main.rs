#![cfg_attr(target_os = "windows", windows_subsystem = "windows")]

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    net::Ipv4Addr,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use chim_client::{
    config::{
        SavedClientConfig, chim_data_dir, load_saved_config, save_saved_config,
        validate_saved_config,
    },
    session::{ChatLine, ChatSession},
};
use chim_core::default_identity;
use clap::Parser;
use eframe::egui;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

const APP_TITLE: &str = "Chim Messenger";
const WINDOW_SIZE: [f32; 2] = [400.0, 700.0];
const WINDOW_MIN_SIZE: [f32; 2] = [350.0, 500.0];

const ACCENT: egui::Color32 = egui::Color32::from_rgb(0x00, 0x88, 0xcc);
const OWN_BUBBLE: egui::Color32 = egui::Color32::from_rgb(0x00, 0x88, 0xcc);
const PEER_BUBBLE: egui::Color32 = egui::Color32::from_rgb(0x2b, 0x52, 0x78);
const ONLINE: egui::Color32 = egui::Color32::from_rgb(0x00, 0xd4, 0x65);
const SYSTEM_TEXT: egui::Color32 = egui::Color32::from_rgb(0xff, 0xb7, 0x4d);
const MUTED_TEXT: egui::Color32 = egui::Color32::from_rgb(0xaa, 0xaa, 0xaa);

#[derive(Parser, Debug, Clone)]
#[command(name = "chim")]
struct ClientArgs {
    /// Join straight away with this identity instead of showing the login screen.
    #[arg(long)]
    identity: Option<String>,
    #[arg(long)]
    group: Option<Ipv4Addr>,
    #[arg(long)]
    port: Option<u16>,
    /// Do not write config.json after a successful join.
    #[arg(long, default_value_t = false)]
    no_save: bool,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn main() {
    init_logging();

    let args = match ClientArgs::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            std::process::exit(2);
        }
    };

    let (defaults, auto_join) = match resolve_config(&args) {
        Ok(resolved) => resolved,
        Err(err) => {
            error!("config resolution failed: {err}");
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(APP_TITLE)
            .with_inner_size(WINDOW_SIZE)
            .with_min_inner_size(WINDOW_MIN_SIZE),
        ..Default::default()
    };

    let save_config = !args.no_save;
    if let Err(err) = eframe::run_native(
        APP_TITLE,
        options,
        Box::new(move |cc| {
            Ok(Box::new(ChimApp::new(cc, defaults, auto_join, save_config)))
        }),
    ) {
        error!("ui exited with error: {err}");
        std::process::exit(1);
    }
}

/// Saved config overlaid with command-line overrides. The flag says whether
/// an identity was given explicitly, in which case the login screen is skipped.
fn resolve_config(args: &ClientArgs) -> Result<(SavedClientConfig, bool), String> {
    let saved = match load_saved_config() {
        Ok(saved) => saved,
        Err(err) => {
            warn!("saved config invalid; starting from defaults: {err}");
            None
        }
    };

    let mut cfg = saved.unwrap_or_else(|| SavedClientConfig::new(default_identity()));
    if let Some(group) = args.group {
        cfg.group = group;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }

    let auto_join = match args.identity.as_deref() {
        Some(identity) => {
            cfg.identity = identity.trim().to_owned();
            true
        }
        None => false,
    };

    validate_saved_config(&cfg)?;
    Ok((cfg, auto_join))
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let log_path = client_log_path();
    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .init();
}

fn client_log_path() -> PathBuf {
    let dir = chim_data_dir().join("logs");
    let _ = std::fs::create_dir_all(&dir);
    dir.join("chim.log")
}

enum Screen {
    Login {
        identity: String,
        error: Option<String>,
    },
    Chat {
        session: ChatSession,
        input: String,
    },
}

struct ChimApp {
    screen: Screen,
    config: SavedClientConfig,
    save_config: bool,
}

impl ChimApp {
    fn new(
        cc: &eframe::CreationContext<'_>,
        config: SavedClientConfig,
        auto_join: bool,
        save_config: bool,
    ) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());

        let mut app = Self {
            screen: Screen::Login {
                identity: config.identity.clone(),
                error: None,
            },
            config,
            save_config,
        };

        if auto_join {
            let identity = app.config.identity.clone();
            app.screen = app.join(&cc.egui_ctx, identity);
        }
        app
    }

    /// Login screen on failure, chat screen on success.
    fn join(&mut self, ctx: &egui::Context, identity: String) -> Screen {
        let mut cfg = self.config.clone();
        cfg.identity = identity.trim().to_owned();
        if let Err(err) = validate_saved_config(&cfg) {
            return Screen::Login {
                identity,
                error: Some(err),
            };
        }

        let repaint_ctx = ctx.clone();
        match ChatSession::connect(cfg.messenger_config(), move || repaint_ctx.request_repaint())
        {
            Ok(session) => {
                info!(identity = %cfg.identity, group = %session.group_addr(), "joined chat");
                ctx.send_viewport_cmd(egui::ViewportCommand::Title(format!(
                    "{APP_TITLE} - {}",
                    session.identity()
                )));
                if self.save_config
                    && let Err(err) = save_saved_config(&cfg)
                {
                    warn!("failed to save config: {err}");
                }
                self.config = cfg;
                Screen::Chat {
                    session,
                    input: String::new(),
                }
            }
            Err(err) => {
                error!(identity = %cfg.identity, "join failed: {err}");
                Screen::Login {
                    identity,
                    error: Some(format!("Connection error: {err}")),
                }
            }
        }
    }

    fn leave(&mut self, notice: Option<String>) {
        let previous = std::mem::replace(
            &mut self.screen,
            Screen::Login {
                identity: self.config.identity.clone(),
                error: notice,
            },
        );
        if let Screen::Chat { mut session, .. } = previous {
            session.close();
        }
    }
}

impl eframe::App for ChimApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let mut submitted: Option<String> = None;
        let mut stopped = false;
        match &mut self.screen {
            Screen::Login { identity, error } => {
                submitted = login_screen(ctx, identity, error.as_deref());
            }
            Screen::Chat { session, input } => {
                session.drain_incoming();
                stopped = session.is_closed();
                chat_screen(ctx, session, input);
            }
        }

        if let Some(identity) = submitted {
            self.screen = self.join(ctx, identity);
        }

        if stopped {
            info!("chat session stopped; returning to login");
            let notice = "Stopped receiving messages. Join again to reconnect.";
            self.leave(Some(notice.to_owned()));
            ctx.send_viewport_cmd(egui::ViewportCommand::Title(APP_TITLE.to_owned()));
        }

        if ctx.input(|i| i.viewport().close_requested()) {
            self.leave(None);
        }
    }
}

/// Returns the identity once the user asks to join.
fn login_screen(
    ctx: &egui::Context,
    identity: &mut String,
    error: Option<&str>,
) -> Option<String> {
    let mut submitted = false;

    egui::CentralPanel::default().show(ctx, |ui| {
        ui.vertical_centered(|ui| {
            ui.add_space(48.0);
            ui.heading(egui::RichText::new(APP_TITLE).size(30.0).strong());
            ui.add_space(8.0);
            ui.label(egui::RichText::new("Local network group chat").color(MUTED_TEXT));
            ui.add_space(36.0);

            ui.label(egui::RichText::new("Your identity").strong());
            let response = ui.add(
                egui::TextEdit::singleline(identity)
                    .hint_text("name or IP address")
                    .desired_width(260.0),
            );
            let enter = response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));

            ui.add_space(16.0);
            let join = ui.add_sized(
                [260.0, 40.0],
                egui::Button::new(egui::RichText::new("Join chat").strong()).fill(ACCENT),
            );
            submitted = (enter || join.clicked()) && !identity.trim().is_empty();

            ui.add_space(12.0);
            if let Some(error) = error {
                ui.colored_label(egui::Color32::LIGHT_RED, error);
            } else {
                ui.label(
                    egui::RichText::new("Your LAN address is filled in automatically")
                        .small()
                        .color(MUTED_TEXT),
                );
            }
        });
    });

    submitted.then(|| identity.clone())
}

fn chat_screen(ctx: &egui::Context, session: &mut ChatSession, input: &mut String) {
    egui::TopBottomPanel::top("chat_header").show(ctx, |ui| {
        ui.add_space(6.0);
        ui.horizontal(|ui| {
            ui.label(egui::RichText::new("Group chat").size(16.0).strong());
            if session.is_closed() {
                ui.colored_label(MUTED_TEXT, "● offline");
            } else {
                ui.colored_label(ONLINE, "● online");
            }
            ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                let identity = format!("{} @ {}", session.identity(), session.group_addr());
                ui.label(egui::RichText::new(identity).small().color(MUTED_TEXT));
            });
        });
        ui.add_space(6.0);
    });

    egui::TopBottomPanel::bottom("chat_input").show(ctx, |ui| {
        ui.add_space(8.0);
        ui.horizontal(|ui| {
            let send_width = 44.0;
            let response = ui.add(
                egui::TextEdit::singleline(input)
                    .hint_text("Type a message…")
                    .desired_width(ui.available_width() - send_width - 8.0),
            );
            let enter = response.lost_focus() && ui.input(|i| i.key_pressed(egui::Key::Enter));
            let send = ui.add_sized([send_width, 28.0], egui::Button::new("↑").fill(ACCENT));

            if enter || send.clicked() {
                // Failures are already on the transcript as a system line.
                if let Ok(true) = session.send_text(input) {
                    input.clear();
                }
                response.request_focus();
            }
        });
        ui.add_space(8.0);
    });

    egui::CentralPanel::default().show(ctx, |ui| {
        egui::ScrollArea::vertical()
            .auto_shrink([false, false])
            .stick_to_bottom(true)
            .show(ui, |ui| {
                for line in session.transcript().iter() {
                    chat_line(ui, line);
                    ui.add_space(6.0);
                }
            });
    });
}

fn chat_line(ui: &mut egui::Ui, line: &ChatLine) {
    let max_bubble_width = (ui.available_width() * 0.75).max(120.0);

    match line {
        ChatLine::Own { text, time } => {
            ui.with_layout(egui::Layout::right_to_left(egui::Align::TOP), |ui| {
                bubble(ui, OWN_BUBBLE, max_bubble_width, None, text, time);
            });
        }
        ChatLine::Peer { sender, text, time } => {
            ui.with_layout(egui::Layout::left_to_right(egui::Align::TOP), |ui| {
                bubble(ui, PEER_BUBBLE, max_bubble_width, Some(sender), text, time);
            });
        }
        ChatLine::System(text) => {
            ui.vertical_centered(|ui| {
                ui.label(
                    egui::RichText::new(format!("⚡ {text}"))
                        .italics()
                        .small()
                        .color(SYSTEM_TEXT),
                );
            });
        }
    }
}

fn bubble(
    ui: &mut egui::Ui,
    fill: egui::Color32,
    max_width: f32,
    sender: Option<&str>,
    text: &str,
    time: &str,
) {
    egui::Frame::default()
        .fill(fill)
        .corner_radius(14.0)
        .inner_margin(egui::vec2(12.0, 6.0))
        .show(ui, |ui| {
            ui.set_max_width(max_width);
            ui.vertical(|ui| {
                if let Some(sender) = sender {
                    ui.label(egui::RichText::new(sender).strong().color(ACCENT));
                }
                let body = egui::RichText::new(text).color(egui::Color32::WHITE);
                ui.add(egui::Label::new(body).wrap());
                ui.label(egui::RichText::new(time).small().color(MUTED_TEXT));
            });
        });
}
