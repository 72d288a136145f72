//! Page-sequenced self-programming of flash.
//!
//! The engine only decides *when* to erase, fill and commit pages; the
//! register sequences that actually do it live behind [`SelfProgram`].

/// Access to the chip's self-programming (SPM) unit.
///
/// All addresses are flash byte addresses. Implementations must not start an
/// operation before [`SelfProgram::wait_ready`] has been called; the engine
/// always does so.
pub trait SelfProgram {
    /// Spin until the previous SPM operation has completed
    fn wait_ready(&mut self);

    /// Erase the page containing `addr`
    fn erase_page(&mut self, addr: u32);

    /// Re-enable reads of the read-while-write section after an erase or write
    fn enable_rww(&mut self);

    /// Load one word into the temporary page buffer at the position of `addr`
    fn load_word(&mut self, addr: u32, word: u16);

    /// Program the temporary page buffer into the page containing `addr`
    fn commit_page(&mut self, addr: u32);

    /// Read one byte of program memory
    fn read_byte(&mut self, addr: u32) -> u8;

    /// Run `f` with interrupts disabled.
    ///
    /// The SPM unlock sequence has a four cycle window that an interrupt
    /// would break, so the engine runs entirely inside this.
    fn free<R, F>(&mut self, f: F) -> R
    where
        Self: Sized,
        F: FnOnce(&mut Self) -> R,
    {
        f(self)
    }
}

/// What one call to [`program`] did
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct PageStats {
    pub erased: usize,
    pub committed: usize,
    pub words: usize,
}

/// Write `data` to flash starting at `word_addr`.
///
/// Each page touched is erased right before its first word is loaded and
/// committed once, either as soon as it fills or at the end of the transfer.
/// An odd trailing byte is completed into a word with `pad` as its high byte.
pub fn program<F: SelfProgram>(
    flash: &mut F,
    page_words: u16,
    word_addr: u32,
    data: &[u8],
    pad: u8,
) -> PageStats {
    let page_words = page_words as u32;
    let mut stats = PageStats::default();
    let mut page_word_count = 0u32;
    let mut addr = word_addr;

    for chunk in data.chunks(2) {
        let page = (addr - addr % page_words) << 1;

        if page_word_count == 0 {
            flash.wait_ready();
            flash.erase_page(page);
            flash.wait_ready();
            flash.enable_rww();
            stats.erased += 1;
        }

        let word = u16::from_le_bytes([chunk[0], chunk.get(1).copied().unwrap_or(pad)]);
        flash.wait_ready();
        flash.load_word(addr << 1, word);
        stats.words += 1;

        page_word_count += 1;
        addr += 1;

        if addr % page_words == 0 {
            commit(flash, page);
            stats.committed += 1;
            page_word_count = 0;
        }
    }

    // Short final page
    if page_word_count != 0 {
        let last = addr - 1;
        commit(flash, (last - last % page_words) << 1);
        stats.committed += 1;
    }

    trace!(
        "Programmed {} words at 0x{:05x}, {} pages",
        stats.words,
        word_addr << 1,
        stats.committed
    );

    stats
}

fn commit<F: SelfProgram>(flash: &mut F, page: u32) {
    flash.wait_ready();
    flash.commit_page(page);
    flash.wait_ready();
    flash.enable_rww();
}
