//! Message text for each notification event.

use super::{ChannelKind, NotificationEvent, PaymentNotice, Recipient, SessionNotice};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub text: String,
    /// None for channels that only carry text
    pub html: Option<String>,
}

pub(super) fn render(event: &NotificationEvent, to: &Recipient, kind: ChannelKind) -> RenderedMessage {
    let (subject, text) = match event {
        NotificationEvent::SessionBooked(n) => (
            format!("Class booked - {}", n.course_title),
            session_text(to, "A new class has been booked.", n),
        ),
        NotificationEvent::SessionReminder(n) => (
            format!("Class Reminder - {}", n.course_title),
            session_text(to, "Reminder: you have a class scheduled soon.", n),
        ),
        NotificationEvent::SessionRescheduled(n) => (
            format!("Class rescheduled - {}", n.course_title),
            session_text(to, "Your class has been moved to a new time.", n),
        ),
        NotificationEvent::SessionCancelled(n) => (
            format!("Class cancelled - {}", n.course_title),
            session_text(to, "Your class has been cancelled.", n),
        ),
        NotificationEvent::MeetingReady(n) => (
            format!("Meeting link ready - {}", n.course_title),
            session_text(to, "The online meeting for your class is ready.", n),
        ),
        NotificationEvent::PaymentPaid(n) => (
            format!("Payment received - {}", n.invoice_number),
            payment_text(to, "Thank you, your payment was received and your enrollment is active.", n),
        ),
        NotificationEvent::PaymentFailed(n) => (
            format!("Payment failed - {}", n.invoice_number),
            payment_text(to, "Your payment could not be completed. You can try again from your dashboard.", n),
        ),
        NotificationEvent::AssessmentSubmitted(n) => (
            format!("New Assessment Submission - {}", n.full_name),
            format!(
                "New assessment received:\n\n\
                 Name: {}\n\
                 Phone: {}\n\
                 Email: {}\n\
                 Preferred Course: {}\n\
                 Trial Date: {}\n\
                 Trial Time: {}\n\
                 Notes: {}\n\n\
                 Please review and assign a teacher.",
                n.full_name,
                n.phone_number,
                n.email.as_deref().unwrap_or("Not provided"),
                n.preferred_course.as_deref().unwrap_or("Not specified"),
                n.preferred_date.as_deref().unwrap_or("Not specified"),
                n.preferred_time.as_deref().unwrap_or("Not specified"),
                if n.notes.is_empty() { "None" } else { n.notes.as_str() },
            ),
        ),
        NotificationEvent::WeeklyReport(n) => (
            format!("Weekly Report - {} to {}", n.start_date, n.end_date),
            n.csv.clone(),
        ),
    };

    let html = match (kind, event) {
        (ChannelKind::WhatsApp, _) => None,
        (_, NotificationEvent::WeeklyReport(_)) => Some(wrap_html(&subject, &format!("<pre>{}</pre>", escape(&text)))),
        _ => Some(wrap_html(&subject, &paragraphs(&text))),
    };

    RenderedMessage { subject, text, html }
}

fn greeting(to: &Recipient) -> String {
    if to.name.trim().is_empty() {
        "Assalamu Alaikum,".to_string()
    } else {
        format!("Assalamu Alaikum {},", to.name)
    }
}

fn session_text(to: &Recipient, headline: &str, n: &SessionNotice) -> String {
    let mut text = format!(
        "{}\n\n{}\n\n\
         Course: {}\n\
         Date: {}\n\
         Time: {} - {}\n\
         Platform: {}\n\
         Meeting Link: {}\n\n\
         Teacher: {}\n\
         Student: {}",
        greeting(to),
        headline,
        n.course_title,
        n.date,
        n.start_time,
        n.end_time,
        n.platform,
        n.join_url.as_deref().unwrap_or("Will be shared soon"),
        n.teacher.name,
        n.student.name,
    );
    if let Some(reason) = n.reason.as_deref().filter(|r| !r.is_empty()) {
        text.push_str(&format!("\nReason: {}", reason));
    }
    text
}

fn payment_text(to: &Recipient, headline: &str, n: &PaymentNotice) -> String {
    format!(
        "{}\n\n{}\n\n\
         Invoice: {}\n\
         Course: {}\n\
         Amount: {}\n\
         Paid via: {}",
        greeting(to),
        headline,
        n.invoice_number,
        n.course_title,
        n.amount,
        n.gateway,
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn paragraphs(text: &str) -> String {
    text.split("\n\n")
        .map(|p| format!("<p>{}</p>", escape(p).replace('\n', "<br>")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn wrap_html(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{title}</title>
    <style>
        body {{ font-family: -apple-system, 'Segoe UI', Roboto, Arial, sans-serif; background-color: #f5f5f5; margin: 0; }}
        .container {{ max-width: 560px; margin: 0 auto; padding: 40px 20px; }}
        .card {{ background-color: #ffffff; border-radius: 8px; padding: 24px; color: #374151; line-height: 1.6; }}
        .header {{ color: #047857; font-size: 20px; font-weight: 600; margin-bottom: 16px; }}
        .footer {{ color: #9ca3af; font-size: 12px; text-align: center; margin-top: 24px; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="card">
            <div class="header">{title}</div>
            {body}
        </div>
        <div class="footer">Amar Quran</div>
    </div>
</body>
</html>"#,
        title = escape(title),
        body = body,
    )
}
