use bolero::check;

fn main() {
    check!().for_each(|data: &[u8]| {
        mimecrypt::mimeparser::parse_mime(data, None).ok();
    });
}
