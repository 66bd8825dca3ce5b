use bolero::check;

fn main() {
    check!().for_each(|data: &[u8]| {
        mimecrypt::armor::unarmor(data).ok();
    });
}
