use serde::Serialize;
use serde_json::Value;
use tinytemplate::{error::Error, format, TinyTemplate};

macro_rules! asset {
    ($file:literal) => {
        include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/", $file))
    };
}

/// HTML pages and email bodies. Every interpolated value is HTML-escaped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Template {
    Login,
    AdminError,
    Dashboard,
    BlockResult,
    Logs,
    AdminNotification,
    Confirmation,
}

impl Template {
    const ALL: [Template; 7] = [
        Template::Login,
        Template::AdminError,
        Template::Dashboard,
        Template::BlockResult,
        Template::Logs,
        Template::AdminNotification,
        Template::Confirmation,
    ];

    fn name(self) -> &'static str {
        match self {
            Template::Login => "login",
            Template::AdminError => "admin-error",
            Template::Dashboard => "dashboard",
            Template::BlockResult => "block-result",
            Template::Logs => "logs",
            Template::AdminNotification => "admin-notification",
            Template::Confirmation => "confirmation",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Template::Login => asset!("login.html"),
            Template::AdminError => asset!("admin-error.html"),
            Template::Dashboard => asset!("dashboard.html"),
            Template::BlockResult => asset!("block-result.html"),
            Template::Logs => asset!("logs.html"),
            Template::AdminNotification => asset!("admin-notification.html"),
            Template::Confirmation => asset!("confirmation.html"),
        }
    }
}

pub fn render(template: Template, context: &impl Serialize) -> String {
    let mut tt = TinyTemplate::new();
    tt.add_formatter("render_paragraphs", render_paragraphs);
    for template in Template::ALL {
        tt.add_template(template.name(), template.source()).unwrap();
    }
    tt.render(template.name(), context).unwrap()
}

fn render_paragraphs(value: &Value, output: &mut String) -> Result<(), Error> {
    output.push_str("<p>");
    let mut formatted = String::new();
    format(value, &mut formatted)?;
    output.push_str(
        &formatted
            .replace("\r\n", "\n")
            .replace("\n\n", "</p><p>")
            .replace('\n', "<br>"),
    );
    output.push_str("</p>");
    Ok(())
}
